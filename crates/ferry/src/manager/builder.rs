use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::quota::{QuotaHandler, QuotaNegotiator};
use super::scheduler::SchedulerState;
use super::{DownloadManager, Inner};
use crate::cache::{CacheProvider, FileCache, MemoryCache};
use crate::config::ManagerConfig;
use crate::http::{HttpClient, ReqwestClient};
use crate::store::{ChunkStore, MemoryChunkStore, SledChunkStore};
use crate::DownloadError;

/// Assembles a [`DownloadManager`].
///
/// Anything not supplied explicitly is created from the [`ManagerConfig`]:
/// a `reqwest` client, a `sled` chunk store at `store_path` and a file cache
/// at `cache_path` (or an in-memory cache when no path is set).
#[derive(Default)]
pub struct DownloadManagerBuilder {
    config: ManagerConfig,
    client: Option<Arc<dyn HttpClient>>,
    store: Option<Arc<dyn ChunkStore>>,
    cache: Option<Arc<dyn CacheProvider>>,
    quota_handler: Option<Arc<dyn QuotaHandler>>,
}

impl DownloadManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Use `store` as the persistent chunk store instead of opening one at
    /// `store_path`.
    pub fn with_chunk_store(mut self, store: Arc<dyn ChunkStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_quota_handler(mut self, handler: impl QuotaHandler + 'static) -> Self {
        self.quota_handler = Some(Arc::new(handler));
        self
    }

    pub async fn build(self) -> Result<DownloadManager, DownloadError> {
        let config = self.config;

        let client = match self.client {
            Some(client) => client,
            None => Arc::new(ReqwestClient::from_config(&config.downloader)?),
        };

        let persistent = match (self.store, &config.store_path) {
            (Some(store), _) => Some(store),
            (None, Some(path)) => {
                match SledChunkStore::open_with_quota(path, config.store_quota_bytes).await {
                    Ok(store) => Some(Arc::new(store) as Arc<dyn ChunkStore>),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Persistent chunk store unavailable, downloads stay in memory");
                        None
                    }
                }
            }
            (None, None) => None,
        };

        let cache = match (self.cache, &config.cache_path) {
            (Some(cache), _) => cache,
            (None, Some(path)) => Arc::new(FileCache::new(path.clone())) as Arc<dyn CacheProvider>,
            (None, None) => Arc::new(MemoryCache::new(config.memory_cache_bytes)),
        };

        let quota = QuotaNegotiator::default();
        if let Some(handler) = self.quota_handler {
            quota.set_handler(handler);
        }

        info!(
            persistent = persistent.as_ref().is_some_and(|s| s.is_persistent()),
            max_concurrent = config.max_concurrent_downloads,
            chunk_size = config.chunk_size,
            "Download manager ready"
        );

        Ok(DownloadManager {
            inner: Arc::new(Inner {
                memory_only: Arc::new(AtomicBool::new(persistent.is_none())),
                persistent,
                memory: Arc::new(MemoryChunkStore::new()),
                client,
                cache,
                quota,
                scheduler: Mutex::new(SchedulerState::default()),
                config,
            }),
        })
    }
}
