use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::Client;
use reqwest::header::{IF_RANGE, RANGE};
use tracing::{debug, info};

use super::{HttpClient, HttpResponse, RangeRequest};
use crate::proxy::build_proxy_from_config;
use crate::{DownloadError, DownloaderConfig};

/// Build a `reqwest` client from the downloader configuration.
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5) // Allow multiple connections to same host
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if let Some(timeout) = config.timeout.filter(|t| !t.is_zero()) {
        client_builder = client_builder.timeout(timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    if let Some(proxy_config) = &config.proxy {
        client_builder = client_builder.proxy(build_proxy_from_config(proxy_config)?);
        info!(proxy_url = %proxy_config.url, "Using explicitly configured proxy for downloads");
    } else if config.use_system_proxy {
        // reqwest picks up system proxy settings unless no_proxy() is called
        debug!("Using system proxy settings for downloads");
    } else {
        client_builder = client_builder.no_proxy();
        debug!("Proxy disabled for downloads");
    }

    client_builder.build().map_err(DownloadError::from)
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: Client,
}

impl ReqwestClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &DownloaderConfig) -> Result<Self, DownloadError> {
        create_client(config).map(Self::new)
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, request: RangeRequest) -> Result<HttpResponse, DownloadError> {
        let mut builder = self.client.get(&request.url);
        if let Some(range) = request.range_header() {
            builder = builder.header(RANGE, range);
            if let Some(validator) = &request.if_range {
                builder = builder.header(IF_RANGE, validator);
            }
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        debug!(url = %request.url, status = %status, offset = request.offset, "Received response");

        let body = response.bytes_stream().map_err(DownloadError::from);
        Ok(HttpResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
