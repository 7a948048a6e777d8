use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::proxy::ProxyConfig;

const DEFAULT_USER_AGENT: &str = concat!("ferry/", env!("CARGO_PKG_VERSION"));

/// Default size of one stored chunk (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 4 * 1024 * 1024;
/// Default amount of buffered body data that triggers a flush (16 MiB).
pub const DEFAULT_FLUSH_THRESHOLD: usize = 16 * 1024 * 1024;
/// Default number of downloads running at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;

/// Configurable options for the HTTP side of a download
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for a whole request, body included. `None` lets large
    /// artifacts take as long as they need; stalls are caught by `read_timeout`.
    pub timeout: Option<Duration>,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
        }
    }
}

impl DownloaderConfig {
    pub fn builder() -> crate::builder::DownloaderConfigBuilder {
        crate::builder::DownloaderConfigBuilder::new()
    }

    /// Headers sent with every request.
    ///
    /// Bodies must arrive unencoded: byte offsets in `Range` and
    /// `Content-Length` refer to the stored representation.
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers
    }
}

/// Options for a [`DownloadManager`](crate::DownloadManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Number of downloads allowed to run at once; the rest wait in FIFO order.
    pub max_concurrent_downloads: usize,

    /// Size of one stored chunk. Changing it invalidates partial downloads.
    pub chunk_size: u32,

    /// Buffered bytes that trigger writing complete chunks to the store.
    pub flush_threshold: usize,

    /// Directory of the persistent chunk store. `None` keeps partial
    /// downloads in memory only.
    pub store_path: Option<PathBuf>,

    /// Directory of the file response cache. `None` uses an in-memory cache.
    pub cache_path: Option<PathBuf>,

    /// Byte budget of the persistent chunk store.
    pub store_quota_bytes: Option<u64>,

    /// Capacity of the in-memory response cache, when one is used.
    pub memory_cache_bytes: u64,

    pub downloader: DownloaderConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            store_path: None,
            cache_path: None,
            store_quota_bytes: None,
            memory_cache_bytes: 2 * 1024 * 1024 * 1024,
            downloader: DownloaderConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn builder() -> crate::builder::ManagerConfigBuilder {
        crate::builder::ManagerConfigBuilder::new()
    }

    /// Flush threshold actually used: never below one chunk, so every flush
    /// writes at least one complete chunk.
    pub(crate) fn effective_flush_threshold(&self) -> usize {
        self.flush_threshold.max(self.chunk_size as usize)
    }
}
