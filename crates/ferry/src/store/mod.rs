//! # Chunk Store
//!
//! Durable storage for partially downloaded resources. Each URL has one
//! [`DownloadMetadata`] record acting as a directory, and its payload lives in
//! fixed-size chunks addressed by `(url, index)`.
//!
//! Writing a chunk and flipping its presence bit happen in one atomic write, so
//! a reader never observes a chunk marked present without its full payload.

mod memory;
mod metadata;
mod persistent;
mod stream;

use async_trait::async_trait;
use bytes::Bytes;

pub use self::memory::MemoryChunkStore;
pub use self::metadata::{ChunkPresence, DownloadMetadata};
pub use self::persistent::SledChunkStore;
pub use self::stream::ChunkStream;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{reason}")]
    Unavailable { reason: String, quota_exceeded: bool },

    #[error("chunk {index} of {url} is missing")]
    MissingChunk { url: String, index: u32 },

    #[error("no download record for {0}")]
    UnknownFile(String),

    #[error("invalid chunk {index} for {url}: {reason}")]
    InvalidChunk {
        url: String,
        index: u32,
        reason: String,
    },

    #[error("corrupt store record: {0}")]
    Corrupt(String),

    #[error("{url} has {total_bytes} bytes, too many chunks of {chunk_size} bytes")]
    TooManyChunks {
        url: String,
        total_bytes: u64,
        chunk_size: u32,
    },
}

impl StoreError {
    pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
        StoreError::Unavailable {
            reason: reason.into(),
            quota_exceeded: false,
        }
    }

    pub(crate) fn quota(used: u64, requested: u64, quota: u64) -> Self {
        StoreError::Unavailable {
            reason: format!(
                "storage quota exceeded: {used} bytes used, {requested} requested, limit {quota}"
            ),
            quota_exceeded: true,
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable {
                quota_exceeded: true,
                ..
            }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistent key/value storage of download metadata and chunk payloads.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Create the record for `url`, or return the existing one when it still
    /// describes the same content. A record whose size, validator or chunk
    /// size differs is replaced and its chunks are purged in the same write.
    async fn init_file(
        &self,
        url: &str,
        total_bytes: u64,
        mime_type: Option<String>,
        validator: Option<String>,
        chunk_size: u32,
    ) -> StoreResult<DownloadMetadata>;

    async fn metadata(&self, url: &str) -> StoreResult<Option<DownloadMetadata>>;

    /// Every download record currently held, in no particular order.
    async fn records(&self) -> StoreResult<Vec<DownloadMetadata>>;

    /// Store chunk `index` and mark it present. Overwriting a present chunk is allowed.
    async fn save_chunk(&self, url: &str, index: u32, data: Bytes) -> StoreResult<()>;

    async fn get_chunk(&self, url: &str, index: u32) -> StoreResult<Option<Bytes>>;

    /// Remove the record and every chunk for `url`.
    async fn delete_file(&self, url: &str) -> StoreResult<()>;

    async fn clear_all(&self) -> StoreResult<()>;

    /// Whether data written here survives a restart.
    fn is_persistent(&self) -> bool;
}

/// Checks that `data` is a well-formed chunk `index` of `meta`.
pub(crate) fn validate_chunk(meta: &DownloadMetadata, index: u32, data: &[u8]) -> StoreResult<()> {
    match meta.expected_chunk_len(index) {
        None => Err(StoreError::InvalidChunk {
            url: meta.url.clone(),
            index,
            reason: format!("index out of range (total {})", meta.total_chunks),
        }),
        Some(expected) if expected != data.len() => Err(StoreError::InvalidChunk {
            url: meta.url.clone(),
            index,
            reason: format!("expected {expected} bytes, got {}", data.len()),
        }),
        Some(_) => Ok(()),
    }
}
