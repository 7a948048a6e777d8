//! # Download Metadata
//!
//! The per-URL directory record: which resource is being assembled, how it is
//! cut into chunks, and which chunks are durably stored.

use serde::{Deserialize, Serialize};

use super::{StoreError, StoreResult};

/// Ordered bit-vector with one bit per chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPresence {
    len: u32,
    bits: Vec<u8>,
}

impl ChunkPresence {
    pub fn new(len: u32) -> Self {
        Self {
            len,
            bits: vec![0; (len as usize).div_ceil(8)],
        }
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// Sets the bit for `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: u32) {
        if index < self.len {
            self.bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    pub fn count(&self) -> u32 {
        self.bits.iter().map(|b| b.count_ones()).sum()
    }

    /// Number of leading chunks that are all present.
    pub fn contiguous_prefix(&self) -> u32 {
        (0..self.len).find(|&i| !self.get(i)).unwrap_or(self.len)
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }
}

/// Metadata for one resource being downloaded into the chunk store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMetadata {
    pub url: String,
    pub total_bytes: u64,
    pub mime_type: Option<String>,
    /// Opaque change-detection token from the server (entity tag, else modification time).
    pub validator: Option<String>,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub chunk_presence: ChunkPresence,
}

impl DownloadMetadata {
    pub fn new(
        url: impl Into<String>,
        total_bytes: u64,
        mime_type: Option<String>,
        validator: Option<String>,
        chunk_size: u32,
    ) -> StoreResult<Self> {
        let url = url.into();
        let total_chunks =
            chunk_count(total_bytes, chunk_size).ok_or_else(|| StoreError::TooManyChunks {
                url: url.clone(),
                total_bytes,
                chunk_size,
            })?;
        Ok(Self {
            url,
            total_bytes,
            mime_type,
            validator,
            chunk_size,
            total_chunks,
            chunk_presence: ChunkPresence::new(total_chunks),
        })
    }

    /// Whether this record describes the same remote content as the arguments.
    pub fn matches(&self, total_bytes: u64, validator: Option<&str>, chunk_size: u32) -> bool {
        self.total_bytes == total_bytes
            && self.validator.as_deref() == validator
            && self.chunk_size == chunk_size
    }

    /// Exact payload length chunk `index` must have.
    pub fn expected_chunk_len(&self, index: u32) -> Option<usize> {
        if index >= self.total_chunks {
            return None;
        }
        let start = index as u64 * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(self.total_bytes);
        Some((end - start) as usize)
    }

    pub fn present_chunks(&self) -> u32 {
        self.chunk_presence.count()
    }

    /// Byte offset a resumed download continues from.
    pub fn resume_offset(&self) -> u64 {
        (self.chunk_presence.contiguous_prefix() as u64 * self.chunk_size as u64)
            .min(self.total_bytes)
    }

    pub fn is_complete(&self) -> bool {
        self.chunk_presence.is_complete()
    }
}

/// Number of chunks covering `total_bytes`, or `None` if it does not fit a chunk index.
pub(crate) fn chunk_count(total_bytes: u64, chunk_size: u32) -> Option<u32> {
    if chunk_size == 0 {
        return Some(0);
    }
    u32::try_from(total_bytes.div_ceil(chunk_size as u64)).ok()
}
