//! # Configuration builders
//!
//! Fluent builders for [`DownloaderConfig`] and [`ManagerConfig`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use ferry_engine::{DownloaderConfig, ManagerConfig};
//! use ferry_engine::proxy::{ProxyConfig, ProxyType};
//!
//! let http = DownloaderConfig::builder()
//!     .with_connect_timeout(Duration::from_secs(15))
//!     .with_read_timeout(Duration::from_secs(60))
//!     .with_user_agent("MyApp/1.0")
//!     .with_header("X-Api-Key", "my-secret-key")
//!     .with_proxy(ProxyConfig::new("http://proxy.example.com:8080", ProxyType::Http))
//!     .build();
//!
//! let config = ManagerConfig::builder()
//!     .with_max_concurrent_downloads(3)
//!     .with_chunk_size(1024 * 1024)
//!     .with_store_path("/var/lib/ferry/store")
//!     .with_cache_path("/var/lib/ferry/cache")
//!     .with_store_quota(512 * 1024 * 1024)
//!     .with_downloader(http)
//!     .build();
//! assert_eq!(config.max_concurrent_downloads, 3);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::{DownloaderConfig, ManagerConfig, proxy::ProxyConfig};

/// Builder for creating DownloaderConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct DownloaderConfigBuilder {
    config: DownloaderConfig,
}

impl DownloaderConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: DownloaderConfig::default(),
        }
    }

    /// Set an overall timeout for each request, body included
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Set the connection timeout (time to establish initial connection)
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the read timeout (maximum time between receiving data chunks)
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.config.follow_redirects = follow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Add a custom HTTP header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<reqwest::header::HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.config.headers.insert(name, value);
        }
        self
    }

    /// Set all HTTP headers, replacing any existing headers
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers = headers;
        self
    }

    /// Merge `headers` into the current set, overriding same-named defaults.
    pub fn with_extra_headers(mut self, headers: HeaderMap) -> Self {
        self.config.headers.extend(headers);
        self
    }

    /// Set the proxy configuration
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self.config.use_system_proxy = false; // Explicit proxy overrides system proxy
        self
    }

    /// Set whether to use system proxy settings if available
    pub fn with_system_proxy(mut self, use_system_proxy: bool) -> Self {
        // Only set system proxy if no explicit proxy is configured
        if self.config.proxy.is_none() {
            self.config.use_system_proxy = use_system_proxy;
        }
        self
    }

    pub fn build(self) -> DownloaderConfig {
        self.config
    }
}

impl Default for DownloaderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`ManagerConfig`]
#[derive(Debug, Clone)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
        }
    }

    /// Number of downloads allowed to run at once (at least one)
    pub fn with_max_concurrent_downloads(mut self, max: usize) -> Self {
        self.config.max_concurrent_downloads = max.max(1);
        self
    }

    /// Size of one stored chunk in bytes (at least one)
    pub fn with_chunk_size(mut self, chunk_size: u32) -> Self {
        self.config.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.config.flush_threshold = threshold;
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.store_path = Some(path.into());
        self
    }

    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.cache_path = Some(path.into());
        self
    }

    /// Limit the persistent chunk store to `bytes` of chunk payload
    pub fn with_store_quota(mut self, bytes: u64) -> Self {
        self.config.store_quota_bytes = Some(bytes);
        self
    }

    pub fn with_memory_cache_bytes(mut self, bytes: u64) -> Self {
        self.config.memory_cache_bytes = bytes;
        self
    }

    pub fn with_downloader(mut self, downloader: DownloaderConfig) -> Self {
        self.config.downloader = downloader;
        self
    }

    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

impl Default for ManagerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyType;

    #[test]
    fn test_builder_defaults() {
        let config = DownloaderConfigBuilder::new().build();
        assert_eq!(config.timeout, None);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.follow_redirects);
        assert!(config.use_system_proxy);
        assert_eq!(
            config.headers[reqwest::header::ACCEPT_ENCODING].to_str().unwrap(),
            "identity"
        );

        let manager = ManagerConfigBuilder::new().build();
        assert_eq!(manager.max_concurrent_downloads, 2);
        assert_eq!(manager.chunk_size, 4 * 1024 * 1024);
        assert_eq!(manager.flush_threshold, 16 * 1024 * 1024);
        assert!(manager.store_path.is_none());
    }

    #[test]
    fn test_builder_customization() {
        let config = DownloaderConfigBuilder::new()
            .with_timeout(Duration::from_secs(60))
            .with_connect_timeout(Duration::from_secs(20))
            .with_follow_redirects(false)
            .with_user_agent("CustomUserAgent/1.0")
            .with_header("X-Custom-Header", "CustomValue")
            .with_header("bad header", "ignored")
            .with_system_proxy(false)
            .build();

        assert_eq!(config.timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert!(!config.follow_redirects);
        assert_eq!(config.user_agent, "CustomUserAgent/1.0");
        assert!(!config.use_system_proxy);
        assert_eq!(config.headers["X-Custom-Header"].to_str().unwrap(), "CustomValue");
        assert!(config.headers.get("bad header").is_none());
    }

    #[test]
    fn extra_headers_keep_defaults() {
        let mut extra = HeaderMap::new();
        extra.insert("x-api-key", HeaderValue::from_static("secret"));
        let config = DownloaderConfigBuilder::new().with_extra_headers(extra).build();

        assert_eq!(config.headers["x-api-key"].to_str().unwrap(), "secret");
        assert_eq!(
            config.headers[reqwest::header::ACCEPT_ENCODING].to_str().unwrap(),
            "identity"
        );
    }

    #[test]
    fn test_proxy_configuration() {
        let proxy_config =
            ProxyConfig::new("http://proxy.example.com:8080", ProxyType::Http).with_auth("user", "pass");

        let config = DownloaderConfigBuilder::new()
            .with_proxy(proxy_config.clone())
            .with_system_proxy(true)
            .build();

        assert!(!config.use_system_proxy);
        let stored_proxy = config.proxy.unwrap();
        assert_eq!(stored_proxy.url, proxy_config.url);
        assert_eq!(stored_proxy.auth.as_ref().unwrap().username, "user");
        assert_eq!(stored_proxy.proxy_type, ProxyType::Http);
    }

    #[test]
    fn test_manager_limits_are_clamped() {
        let config = ManagerConfigBuilder::new()
            .with_max_concurrent_downloads(0)
            .with_chunk_size(0)
            .with_flush_threshold(10)
            .build();
        assert_eq!(config.max_concurrent_downloads, 1);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.effective_flush_threshold(), 10);

        let config = ManagerConfigBuilder::new()
            .with_chunk_size(1024)
            .with_flush_threshold(10)
            .build();
        assert_eq!(config.effective_flush_threshold(), 1024);
    }
}
