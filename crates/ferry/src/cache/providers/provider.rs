//! # Cache Provider
//!
//! The trait every response cache implementation follows.

use async_trait::async_trait;
use bytes::Bytes;

use crate::cache::types::{
    ByteStream, CacheEntryInfo, CacheKey, CacheLookupResult, CacheMetadata, CacheResult,
};

/// A URL-keyed store of finished resources.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Get an entry from the cache
    async fn get(&self, key: &CacheKey) -> CacheLookupResult;

    /// Metadata and stored length of an entry, without loading the payload.
    async fn inspect(&self, key: &CacheKey) -> CacheResult<Option<CacheEntryInfo>>;

    /// Put an entry into the cache
    async fn put(&self, key: CacheKey, data: Bytes, metadata: CacheMetadata) -> CacheResult<()>;

    /// Commit an entry from a stream of parts.
    ///
    /// The entry becomes visible only once the whole stream has been consumed
    /// and its length equals `metadata.size`. Any error from the stream, or a
    /// length mismatch, leaves the cache without an entry for `key`.
    async fn put_stream(
        &self,
        key: CacheKey,
        data: ByteStream,
        metadata: CacheMetadata,
    ) -> CacheResult<u64>;

    /// Remove an entry from the cache
    async fn remove(&self, key: &CacheKey) -> CacheResult<()>;
}
