//! # Ferry
//!
//! A resumable, concurrency-bounded download engine for large artifacts.
//!
//! Resources are fetched with HTTP range requests into a chunk store, so an
//! interrupted download picks up where it left off, and are then assembled
//! into a response cache from which consumers read them.
//!
//! ## Features
//!
//! - Chunked persistence of partial downloads (`sled`), with an in-memory fallback
//! - Resume via `Range`/`If-Range`, restarting when the server's validator changes
//! - Deduplication of concurrent requests for the same URL
//! - FIFO queue with a bounded number of concurrent downloads
//! - Streaming assembly into a file-backed or in-memory response cache
//! - One-time negotiation when the persistent store runs out of space

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod manager;
pub mod progress;
pub mod proxy;
pub mod store;

#[cfg(test)]
mod test_utils;

pub use builder::{DownloaderConfigBuilder, ManagerConfigBuilder};
pub use cache::{CacheKey, CacheMetadata, CacheProvider, FileCache, MemoryCache};
pub use config::{DownloaderConfig, ManagerConfig};
pub use error::{DownloadError, ErrorKind};
pub use fetcher::RangeFetcher;
pub use http::{HttpClient, ReqwestClient, create_client};

// Re-export manager types
pub use manager::{
    DownloadManager, DownloadManagerBuilder, QuotaContext, QuotaDecision, QuotaHandler,
    VerifyFailure, VerifyReport,
};
pub use progress::{Progress, ProgressSink};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use store::{
    ChunkStore, ChunkStream, DownloadMetadata, MemoryChunkStore, SledChunkStore, StoreError,
};
