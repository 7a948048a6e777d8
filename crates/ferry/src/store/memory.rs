//! # Memory Chunk Store
//!
//! A chunk store held entirely in process memory. Used when persistent storage
//! is unavailable for the session, and in tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{ChunkStore, DownloadMetadata, StoreError, StoreResult, validate_chunk};

#[derive(Default)]
struct MemoryState {
    files: HashMap<String, DownloadMetadata>,
    chunks: BTreeMap<(String, u32), Bytes>,
    used_bytes: u64,
}

impl MemoryState {
    fn purge_chunks(&mut self, url: &str) -> usize {
        let keys: Vec<(String, u32)> = self
            .chunks
            .range((url.to_owned(), 0)..=(url.to_owned(), u32::MAX))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            if let Some(data) = self.chunks.remove(key) {
                self.used_bytes -= data.len() as u64;
            }
        }
        keys.len()
    }
}

#[derive(Default)]
pub struct MemoryChunkStore {
    state: Mutex<MemoryState>,
    quota: Option<u64>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses chunk writes once `quota` payload bytes are held.
    pub fn with_quota(quota: u64) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            quota: Some(quota),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn init_file(
        &self,
        url: &str,
        total_bytes: u64,
        mime_type: Option<String>,
        validator: Option<String>,
        chunk_size: u32,
    ) -> StoreResult<DownloadMetadata> {
        let mut state = self.state.lock();
        if let Some(existing) = state.files.get(url) {
            if existing.matches(total_bytes, validator.as_deref(), chunk_size) {
                return Ok(existing.clone());
            }
            let purged = state.purge_chunks(url);
            debug!(url = %url, purged, "Replacing stale download record");
        }

        let meta = DownloadMetadata::new(url, total_bytes, mime_type, validator, chunk_size)?;
        state.files.insert(url.to_owned(), meta.clone());
        Ok(meta)
    }

    async fn metadata(&self, url: &str) -> StoreResult<Option<DownloadMetadata>> {
        Ok(self.state.lock().files.get(url).cloned())
    }

    async fn records(&self) -> StoreResult<Vec<DownloadMetadata>> {
        Ok(self.state.lock().files.values().cloned().collect())
    }

    async fn save_chunk(&self, url: &str, index: u32, data: Bytes) -> StoreResult<()> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let meta = state
            .files
            .get_mut(url)
            .ok_or_else(|| StoreError::UnknownFile(url.to_owned()))?;
        validate_chunk(meta, index, &data)?;

        let key = (url.to_owned(), index);
        let previous = state.chunks.get(&key).map_or(0, |c| c.len() as u64);
        let used_after = state.used_bytes - previous + data.len() as u64;
        if let Some(quota) = self.quota {
            if used_after > quota {
                return Err(StoreError::quota(
                    state.used_bytes,
                    data.len() as u64,
                    quota,
                ));
            }
        }

        state.chunks.insert(key, data);
        state.used_bytes = used_after;
        meta.chunk_presence.set(index);
        Ok(())
    }

    async fn get_chunk(&self, url: &str, index: u32) -> StoreResult<Option<Bytes>> {
        Ok(self
            .state
            .lock()
            .chunks
            .get(&(url.to_owned(), index))
            .cloned())
    }

    async fn delete_file(&self, url: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.files.remove(url);
        state.purge_chunks(url);
        Ok(())
    }

    async fn clear_all(&self) -> StoreResult<()> {
        *self.state.lock() = MemoryState::default();
        Ok(())
    }

    fn is_persistent(&self) -> bool {
        false
    }
}
