//! # Memory Cache Provider
//!
//! This module provides an in-memory cache implementation using Moka caching.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use moka::future::Cache as MokaCache;
use tokio::io;
use tracing::{debug, warn};

use crate::cache::providers::CacheProvider;
use crate::cache::types::{
    ByteStream, CacheEntryInfo, CacheKey, CacheLookupResult, CacheMetadata, CacheResult,
    size_mismatch,
};

/// Entry in the memory cache
#[derive(Clone)]
struct CacheEntry {
    data: Bytes,
    metadata: CacheMetadata,
}

/// Memory cache provider implementation using Moka
#[derive(Clone)]
pub struct MemoryCache {
    cache: MokaCache<CacheKey, CacheEntry>,
    /// Maximum size for this cache in bytes
    max_size: u64,
}

impl MemoryCache {
    /// Create a new memory cache holding at most `max_size_bytes` of payload.
    pub fn new(max_size_bytes: u64) -> Self {
        // Size based eviction
        let cache = MokaCache::builder()
            .weigher(|_k, v: &CacheEntry| v.data.len().try_into().unwrap_or(u32::MAX))
            .max_capacity(max_size_bytes)
            .build();

        debug!(max_size = max_size_bytes, "Memory cache created with size limit");

        Self {
            cache,
            max_size: max_size_bytes,
        }
    }

    fn too_large(&self, key: &CacheKey, size: u64) -> io::Error {
        warn!(
            url = %key.url,
            size = size,
            max_size = self.max_size,
            "Entry too large for memory cache"
        );
        io::Error::new(
            io::ErrorKind::StorageFull,
            format!(
                "entry of {size} bytes exceeds memory cache capacity of {} bytes",
                self.max_size
            ),
        )
    }
}

#[async_trait::async_trait]
impl CacheProvider for MemoryCache {
    async fn get(&self, key: &CacheKey) -> CacheLookupResult {
        Ok(self
            .cache
            .get(key)
            .await
            .map(|entry| (entry.data, entry.metadata)))
    }

    async fn inspect(&self, key: &CacheKey) -> CacheResult<Option<CacheEntryInfo>> {
        Ok(self.cache.get(key).await.map(|entry| CacheEntryInfo {
            stored_size: entry.data.len() as u64,
            metadata: entry.metadata,
        }))
    }

    async fn put(&self, key: CacheKey, data: Bytes, metadata: CacheMetadata) -> CacheResult<()> {
        // A single entry shouldn't be larger than the total cache size
        if data.len() as u64 > self.max_size {
            return Err(self.too_large(&key, data.len() as u64));
        }
        self.cache.insert(key, CacheEntry { data, metadata }).await;
        Ok(())
    }

    async fn put_stream(
        &self,
        key: CacheKey,
        mut data: ByteStream,
        metadata: CacheMetadata,
    ) -> CacheResult<u64> {
        if metadata.size > self.max_size {
            return Err(self.too_large(&key, metadata.size));
        }

        let mut buffer = BytesMut::with_capacity(metadata.size as usize);
        while let Some(part) = data.next().await {
            let part = part?;
            if (buffer.len() + part.len()) as u64 > metadata.size {
                return Err(size_mismatch(
                    metadata.size,
                    (buffer.len() + part.len()) as u64,
                ));
            }
            buffer.extend_from_slice(&part);
        }

        let written = buffer.len() as u64;
        if written != metadata.size {
            return Err(size_mismatch(metadata.size, written));
        }

        self.put(key, buffer.freeze(), metadata).await?;
        Ok(written)
    }

    async fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        if self.cache.remove(key).await.is_some() {
            debug!(url = %key.url, "Removed entry from memory cache");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(format!("https://host/{name}"))
    }

    #[tokio::test]
    async fn put_get_hit() {
        init_tracing();
        let cache = MemoryCache::new(100);
        let k = key("item1");
        let metadata = CacheMetadata::new(5).with_content_type("text/plain");

        cache
            .put(k.clone(), Bytes::from_static(b"hello"), metadata.clone())
            .await
            .unwrap();
        cache.cache.run_pending_tasks().await;

        let (data, res_m) = cache.get(&k).await.unwrap().unwrap();
        assert_eq!(&data[..], b"hello");
        assert_eq!(res_m, metadata);
        assert!(cache.get(&key("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_stream_assembles_parts() {
        let cache = MemoryCache::new(100);
        let k = key("streamed");
        let parts: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ])
        .boxed();

        let written = cache
            .put_stream(k.clone(), parts, CacheMetadata::new(6))
            .await
            .unwrap();
        assert_eq!(written, 6);
        let info = cache.inspect(&k).await.unwrap().unwrap();
        assert!(info.is_intact());
    }

    #[tokio::test]
    async fn oversized_entry_is_rejected() {
        let cache = MemoryCache::new(4);
        let k = key("big");
        let err = cache
            .put(k.clone(), Bytes::from_static(b"hello"), CacheMetadata::new(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);
        assert!(cache.get(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn overrunning_stream_is_rejected() {
        let cache = MemoryCache::new(100);
        let k = key("overrun");
        let parts: ByteStream = stream::iter(vec![Ok(Bytes::from_static(b"abcdef"))]).boxed();
        let err = cache
            .put_stream(k.clone(), parts, CacheMetadata::new(3))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(cache.inspect(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_keeps_other_entries() {
        let cache = MemoryCache::new(100);
        cache
            .put(key("a"), Bytes::from_static(b"a"), CacheMetadata::new(1))
            .await
            .unwrap();
        cache
            .put(key("b"), Bytes::from_static(b"b"), CacheMetadata::new(1))
            .await
            .unwrap();

        cache.remove(&key("a")).await.unwrap();
        cache.cache.run_pending_tasks().await;
        assert!(cache.get(&key("a")).await.unwrap().is_none());
        assert!(cache.get(&key("b")).await.unwrap().is_some());
    }
}
