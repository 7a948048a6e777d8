//! # HTTP seam
//!
//! The fetcher talks to the network only through [`HttpClient`], so a
//! download can be driven by a real [`ReqwestClient`] or by scripted
//! responses.

mod client;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap};

use crate::DownloadError;

pub use self::client::{ReqwestClient, create_client};

/// Body of a response as a stream of byte parts.
pub type BodyStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// A GET request, optionally resuming at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub url: String,
    /// Sends `Range: bytes=<offset>-` when non-zero.
    pub offset: u64,
    /// Sent as `If-Range`, only together with a range.
    pub if_range: Option<String>,
}

impl RangeRequest {
    pub fn full(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            offset: 0,
            if_range: None,
        }
    }

    pub fn resume(url: impl Into<String>, offset: u64, validator: Option<&str>) -> Self {
        Self {
            url: url.into(),
            offset,
            if_range: validator.filter(|v| usable_for_if_range(v)).map(str::to_owned),
        }
    }

    pub fn is_ranged(&self) -> bool {
        self.offset > 0
    }

    /// Value of the `Range` header for this request, if any.
    pub fn range_header(&self) -> Option<String> {
        self.is_ranged().then(|| format!("bytes={}-", self.offset))
    }
}

/// Weak entity tags cannot be used with `If-Range`; strong tags and dates can.
fn usable_for_if_range(validator: &str) -> bool {
    !validator.starts_with("W/")
}

/// Parsed `Content-Range: bytes <start>-<end>/<total>` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    /// `None` when the server sent `*` for the complete length.
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;
        let (start, end) = range.trim().split_once('-')?;
        let total = match total.trim() {
            "*" => None,
            n => Some(n.parse().ok()?),
        };
        Some(Self {
            start: start.trim().parse().ok()?,
            end: end.trim().parse().ok()?,
            total,
        })
    }
}

/// Status, headers and streaming body of a response.
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl HttpResponse {
    fn header_str(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str(header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn content_range(&self) -> Option<ContentRange> {
        self.header_str(header::CONTENT_RANGE)
            .and_then(ContentRange::parse)
    }

    /// Change-detection token: the entity tag, else the modification time.
    pub fn validator(&self) -> Option<String> {
        self.header_str(header::ETAG)
            .or_else(|| self.header_str(header::LAST_MODIFIED))
            .map(str::to_owned)
    }

    pub fn content_type(&self) -> Option<String> {
        self.header_str(header::CONTENT_TYPE).map(str::to_owned)
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Issues GET requests and exposes the body as a stream.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, request: RangeRequest) -> Result<HttpResponse, DownloadError>;
}
