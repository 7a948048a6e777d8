use reqwest::Proxy;

use crate::DownloadError;

/// Proxy configuration types
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum ProxyType {
    /// HTTP proxy
    Http,
    /// HTTPS proxy
    Https,
    /// SOCKS5 proxy
    Socks5,
    /// All protocols proxy (use this for general-purpose proxies)
    All,
}

/// Proxy authentication type
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: ProxyType,
    pub auth: Option<ProxyAuth>,
}

impl ProxyConfig {
    pub fn new(url: impl Into<String>, proxy_type: ProxyType) -> Self {
        Self {
            url: url.into(),
            proxy_type,
            auth: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

/// Build a reqwest Proxy object from our proxy configuration
pub fn build_proxy_from_config(config: &ProxyConfig) -> Result<Proxy, DownloadError> {
    let invalid = |e: reqwest::Error| DownloadError::InvalidUrl(format!("proxy {}: {e}", config.url));

    let mut proxy = match config.proxy_type {
        ProxyType::Http => Proxy::http(&config.url).map_err(invalid)?,
        ProxyType::Https => Proxy::https(&config.url).map_err(invalid)?,
        ProxyType::Socks5 => {
            let url = if config.url.starts_with("socks5://") || config.url.starts_with("socks5h://")
            {
                config.url.clone()
            } else {
                format!("socks5://{}", config.url)
            };
            Proxy::all(&url).map_err(invalid)?
        }
        ProxyType::All => Proxy::all(&config.url).map_err(invalid)?,
    };

    if let Some(auth) = &config.auth {
        proxy = proxy.basic_auth(&auth.username, &auth.password);
    }

    Ok(proxy)
}
