//! # Response Cache
//!
//! Downstream storage for fully assembled resources. A download is finished
//! once its bytes are committed here; the chunk store only holds work in
//! progress.

pub mod providers;
mod types;

pub use types::{
    ByteStream, CacheEntryInfo, CacheKey, CacheLookupResult, CacheMetadata, CacheResult,
};

pub use providers::{CacheProvider, FileCache, MemoryCache};
