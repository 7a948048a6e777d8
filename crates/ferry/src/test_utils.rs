//! Shared fixtures for engine tests: a scripted [`HttpClient`] serving
//! in-memory resources and a few async helpers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use tokio::sync::Semaphore;

use crate::DownloadError;
use crate::http::{HttpClient, HttpResponse, RangeRequest};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Deterministic payload of `len` bytes.
pub(crate) fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// A resource served by [`ScriptedHttp`].
#[derive(Clone)]
pub(crate) struct FakeResource {
    pub data: Bytes,
    pub validator: Option<String>,
    pub content_type: Option<String>,
    /// Answer `Range` requests with 206; otherwise always 200 with the full body.
    pub supports_range: bool,
    /// Fall back to a full 200 when `If-Range` does not match the validator.
    pub honor_if_range: bool,
    /// Omit `Content-Length` on full responses.
    pub omit_length: bool,
    /// `Content-Length` announced on full responses instead of the payload length.
    pub declared_len: Option<u64>,
    /// Size of each body part.
    pub piece_size: usize,
    /// Break the body once this absolute offset is reached. Applies once.
    pub fail_after: Option<u64>,
    /// Each request waits for one permit before responding.
    pub gate: Option<Arc<Semaphore>>,
}

impl FakeResource {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            validator: Some("\"v1\"".to_owned()),
            content_type: Some("application/octet-stream".to_owned()),
            supports_range: true,
            honor_if_range: true,
            omit_length: false,
            declared_len: None,
            piece_size: 64 * 1024,
            fail_after: None,
            gate: None,
        }
    }

    pub fn with_validator(mut self, validator: Option<&str>) -> Self {
        self.validator = validator.map(str::to_owned);
        self
    }

    pub fn without_range_support(mut self) -> Self {
        self.supports_range = false;
        self
    }

    pub fn ignoring_if_range(mut self) -> Self {
        self.honor_if_range = false;
        self
    }

    pub fn without_length(mut self) -> Self {
        self.omit_length = true;
        self
    }

    pub fn declaring_len(mut self, len: u64) -> Self {
        self.declared_len = Some(len);
        self
    }

    pub fn failing_after(mut self, offset: u64) -> Self {
        self.fail_after = Some(offset);
        self
    }

    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

/// One request as seen by [`ScriptedHttp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedRequest {
    pub url: String,
    pub range: Option<String>,
    pub if_range: Option<String>,
}

#[derive(Default)]
pub(crate) struct ScriptedHttp {
    resources: Mutex<HashMap<String, FakeResource>>,
    log: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, resource: FakeResource) {
        self.resources.lock().insert(url.to_owned(), resource);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().clone()
    }

    pub fn requests_for(&self, url: &str) -> Vec<RecordedRequest> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    fn respond(&self, request: &RangeRequest) -> Result<HttpResponse, DownloadError> {
        let mut resources = self.resources.lock();
        let Some(resource) = resources.get_mut(&request.url) else {
            return Ok(empty_response(StatusCode::NOT_FOUND));
        };
        let len = resource.data.len() as u64;

        let if_range_ok = match (&request.if_range, resource.honor_if_range) {
            (Some(sent), true) => resource.validator.as_deref() == Some(sent.as_str()),
            _ => true,
        };
        let partial = request.is_ranged() && resource.supports_range && if_range_ok;
        let start = if partial { request.offset } else { 0 };
        if start > len {
            return Ok(empty_response(StatusCode::RANGE_NOT_SATISFIABLE));
        }

        let mut headers = HeaderMap::new();
        if let Some(validator) = &resource.validator {
            headers.insert(header::ETAG, HeaderValue::from_str(validator).unwrap());
        }
        if let Some(content_type) = &resource.content_type {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(content_type).unwrap(),
            );
        }
        let status = if partial {
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes {start}-{}/{len}", len.saturating_sub(1)))
                    .unwrap(),
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len - start));
            StatusCode::PARTIAL_CONTENT
        } else {
            if !resource.omit_length {
                let declared = resource.declared_len.unwrap_or(len);
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(declared));
            }
            StatusCode::OK
        };

        let fail_at = resource.fail_after.take().filter(|&at| at < len);
        let end = fail_at.map_or(len, |at| at.max(start));
        let mut parts: Vec<Result<Bytes, DownloadError>> = (start..end)
            .step_by(resource.piece_size)
            .map(|from| {
                let to = (from + resource.piece_size as u64).min(end);
                Ok(resource.data.slice(from as usize..to as usize))
            })
            .collect();
        if fail_at.is_some() {
            parts.push(Err(DownloadError::Network("connection reset".to_owned())));
        }

        Ok(HttpResponse {
            status,
            headers,
            body: Box::pin(stream::iter(parts)),
        })
    }
}

fn empty_response(status: StatusCode) -> HttpResponse {
    HttpResponse {
        status,
        headers: HeaderMap::new(),
        body: Box::pin(stream::empty()),
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn get(&self, request: RangeRequest) -> Result<HttpResponse, DownloadError> {
        self.log.lock().push(RecordedRequest {
            url: request.url.clone(),
            range: request.range_header(),
            if_range: request.if_range.clone(),
        });

        let gate = self
            .resources
            .lock()
            .get(&request.url)
            .and_then(|r| r.gate.clone());
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .expect("gate semaphore closed")
                .forget();
        }

        self.respond(&request)
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
