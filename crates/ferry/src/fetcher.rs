//! # Range Fetcher
//!
//! Downloads one resource into a [`ChunkStore`], resuming from the stored
//! contiguous prefix with an HTTP range request when possible.
//!
//! The body is accumulated in a bounded buffer. Whenever the buffer reaches
//! the flush threshold every complete chunk is written out; the sub-chunk
//! remainder stays buffered until more data arrives or the body ends. Memory
//! use per download is therefore about one flush threshold plus one chunk.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::BytesMut;
use futures::StreamExt;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::{BodyStream, HttpClient, HttpResponse, RangeRequest};
use crate::progress::{Progress, ProgressSink};
use crate::store::{ChunkStore, DownloadMetadata};
use crate::DownloadError;

pub struct RangeFetcher {
    client: Arc<dyn HttpClient>,
    store: Arc<dyn ChunkStore>,
    chunk_size: u32,
    flush_threshold: usize,
    cancel: CancellationToken,
    progress: Option<ProgressSink>,
    halt: Option<Arc<AtomicBool>>,
}

impl RangeFetcher {
    pub fn new(
        client: Arc<dyn HttpClient>,
        store: Arc<dyn ChunkStore>,
        chunk_size: u32,
        flush_threshold: usize,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            client,
            store,
            chunk_size,
            flush_threshold: flush_threshold.max(chunk_size as usize),
            cancel: CancellationToken::new(),
            progress: None,
            halt: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Stop with `StorageUnavailable` at the next flush once `flag` is set.
    pub fn with_halt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.halt = Some(flag);
        self
    }

    /// Download `url` until every chunk is stored, returning the final record.
    ///
    /// A resume the server cannot serve consistently is retried once from
    /// offset zero; that retry never issues a range request.
    pub async fn fetch(&self, url: &str) -> Result<DownloadMetadata, DownloadError> {
        let existing = self
            .cancellable(url, async {
                self.store.metadata(url).await.map_err(DownloadError::from)
            })
            .await?;
        let existing = existing.filter(|meta| meta.chunk_size == self.chunk_size);

        if let Some(meta) = &existing {
            if meta.is_complete() {
                debug!(url = %url, "All chunks already stored");
                self.report(Progress::complete(meta.total_bytes));
                return Ok(meta.clone());
            }
        }

        if let Some(meta) = existing.filter(|meta| meta.resume_offset() > 0) {
            match self.resume(meta).await {
                Err(DownloadError::RangeNotSupported { reason, .. }) => {
                    warn!(url = %url, reason = %reason, "Stored download is stale, restarting from zero");
                    self.purge(url).await?;
                }
                other => return other,
            }
        }

        let request = RangeRequest::full(url);
        info!(url = %url, "Requesting resource");
        let response = self.cancellable(url, self.client.get(request)).await?;
        match response.status {
            StatusCode::OK => self.start_fresh(url, response).await,
            status => Err(DownloadError::HttpStatus {
                url: url.to_owned(),
                status,
            }),
        }
    }

    /// Continue `meta` from its contiguous prefix. Fails with
    /// `RangeNotSupported` when the partial response does not match the record.
    async fn resume(&self, meta: DownloadMetadata) -> Result<DownloadMetadata, DownloadError> {
        let url = meta.url.clone();
        let request = RangeRequest::resume(&url, meta.resume_offset(), meta.validator.as_deref());
        info!(url = %url, offset = request.offset, "Resuming download");

        let response = self.cancellable(&url, self.client.get(request.clone())).await?;
        match response.status {
            StatusCode::PARTIAL_CONTENT => {
                check_partial(&response, &meta, request.offset)
                    .map_err(|reason| DownloadError::RangeNotSupported {
                        url: url.clone(),
                        reason,
                    })?;
                self.stream_body(meta, request.offset, response.body).await
            }
            StatusCode::OK => {
                warn!(url = %url, "Range request answered with full body, discarding partial chunks");
                self.purge(&url).await?;
                self.start_fresh(&url, response).await
            }
            status => Err(DownloadError::HttpStatus { url, status }),
        }
    }

    async fn start_fresh(
        &self,
        url: &str,
        response: HttpResponse,
    ) -> Result<DownloadMetadata, DownloadError> {
        let total = response.content_length().ok_or_else(|| {
            DownloadError::Network(format!("{url}: response has no Content-Length"))
        })?;
        let content_type = response.content_type();
        let validator = response.validator();

        let meta = self
            .cancellable(url, async {
                self.store
                    .init_file(url, total, content_type, validator, self.chunk_size)
                    .await
                    .map_err(DownloadError::from)
            })
            .await?;
        self.stream_body(meta, 0, response.body).await
    }

    async fn stream_body(
        &self,
        meta: DownloadMetadata,
        offset: u64,
        mut body: BodyStream,
    ) -> Result<DownloadMetadata, DownloadError> {
        let url = meta.url.as_str();
        let total = meta.total_bytes;
        let mut next_index = (offset / self.chunk_size as u64) as u32;
        let mut received = offset;
        let mut buffer = BytesMut::with_capacity(self.flush_threshold + self.chunk_size as usize);

        while let Some(part) = self.cancellable(url, async { Ok(body.next().await) }).await? {
            let part = part?;
            received += part.len() as u64;
            if received > total {
                return Err(size_mismatch(url, total, received));
            }
            buffer.extend_from_slice(&part);
            if buffer.len() >= self.flush_threshold {
                self.flush(&meta, &mut buffer, &mut next_index, false).await?;
            }
        }

        if received != total {
            return Err(size_mismatch(url, total, received));
        }
        self.flush(&meta, &mut buffer, &mut next_index, true).await?;

        let stored = self
            .store
            .metadata(url)
            .await?
            .ok_or_else(|| DownloadError::Store(format!("download record for {url} vanished")))?;
        if !stored.is_complete() {
            let present: u64 = (0..stored.total_chunks)
                .filter(|&i| stored.chunk_presence.get(i))
                .filter_map(|i| stored.expected_chunk_len(i))
                .map(|len| len as u64)
                .sum();
            return Err(size_mismatch(url, total, present));
        }

        info!(url = %url, total_bytes = total, "Download complete");
        Ok(stored)
    }

    /// Write every complete chunk in `buffer`, plus the remainder when `last`.
    async fn flush(
        &self,
        meta: &DownloadMetadata,
        buffer: &mut BytesMut,
        next_index: &mut u32,
        last: bool,
    ) -> Result<(), DownloadError> {
        let url = meta.url.as_str();
        if self.halt.as_ref().is_some_and(|flag| flag.load(Ordering::Acquire)) {
            return Err(DownloadError::StorageUnavailable {
                reason: "persistent storage was given up for this session".to_owned(),
                quota_exceeded: false,
            });
        }

        let chunk_size = self.chunk_size as usize;
        let first = *next_index;
        while buffer.len() >= chunk_size || (last && !buffer.is_empty()) {
            let take = buffer.len().min(chunk_size);
            let chunk = buffer.split_to(take).freeze();
            if self.cancel.is_cancelled() {
                return Err(DownloadError::aborted(url));
            }
            self.store.save_chunk(url, *next_index, chunk).await?;
            *next_index += 1;
        }

        if *next_index > first {
            debug!(url = %url, from = first, to = *next_index, "Flushed chunks");
        }
        let loaded = (*next_index as u64 * self.chunk_size as u64).min(meta.total_bytes);
        self.report(Progress::new(loaded, meta.total_bytes));
        Ok(())
    }

    async fn purge(&self, url: &str) -> Result<(), DownloadError> {
        self.cancellable(url, async {
            self.store.delete_file(url).await.map_err(DownloadError::from)
        })
        .await
    }

    fn report(&self, progress: Progress) {
        if let Some(sink) = &self.progress {
            sink(progress);
        }
    }

    /// Race `fut` against cancellation.
    async fn cancellable<T>(
        &self,
        url: &str,
        fut: impl Future<Output = Result<T, DownloadError>>,
    ) -> Result<T, DownloadError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DownloadError::aborted(url)),
            result = fut => result,
        }
    }
}

/// Checks a 206 response against the stored record.
fn check_partial(
    response: &HttpResponse,
    meta: &DownloadMetadata,
    offset: u64,
) -> Result<(), String> {
    let range = response
        .content_range()
        .ok_or_else(|| "partial response without a usable Content-Range".to_owned())?;
    if range.start != offset {
        return Err(format!("requested offset {offset}, server sent {}", range.start));
    }
    if range.total != Some(meta.total_bytes) {
        return Err(format!(
            "resource size changed from {} to {:?}",
            meta.total_bytes, range.total
        ));
    }
    let current = response.validator();
    let unchanged = match (meta.validator.as_deref(), current.as_deref()) {
        (Some(stored), Some(current)) => stored == current,
        (None, None) => true,
        _ => false,
    };
    if !unchanged {
        return Err(format!(
            "validator changed from {:?} to {:?}",
            meta.validator, current
        ));
    }
    Ok(())
}

fn size_mismatch(url: &str, expected: u64, actual: u64) -> DownloadError {
    DownloadError::SizeMismatch {
        url: url.to_owned(),
        expected,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryChunkStore;
    use crate::test_utils::{FakeResource, ScriptedHttp, init_tracing, payload};
    use parking_lot::Mutex;

    const URL: &str = "https://models.example.com/encoder.onnx";

    fn fetcher(http: &Arc<ScriptedHttp>, store: &Arc<MemoryChunkStore>, chunk: u32) -> RangeFetcher {
        RangeFetcher::new(http.clone(), store.clone(), chunk, chunk as usize)
    }

    async fn stored_bytes(store: &MemoryChunkStore, meta: &DownloadMetadata) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..meta.total_chunks {
            out.extend_from_slice(&store.get_chunk(&meta.url, i).await.unwrap().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn fresh_download_stores_every_chunk() {
        init_tracing();
        let http = ScriptedHttp::new();
        let data = payload(2_500);
        http.serve(URL, FakeResource::new(data.clone()));
        let store = Arc::new(MemoryChunkStore::new());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let meta = fetcher(&http, &store, 1_000)
            .with_progress(Arc::new(move |p: Progress| sink_events.lock().push(p)))
            .fetch(URL)
            .await
            .unwrap();

        assert_eq!(meta.total_chunks, 3);
        assert_eq!(meta.mime_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(stored_bytes(&store, &meta).await, data.to_vec());
        assert_eq!(http.requests()[0].range, None);

        let events = events.lock();
        assert_eq!(events.last(), Some(&Progress::complete(2_500)));
        assert!(events.windows(2).all(|w| w[0].loaded <= w[1].loaded));
    }

    #[tokio::test]
    async fn flush_threshold_batches_chunks() {
        let http = ScriptedHttp::new();
        let mut resource = FakeResource::new(payload(10_000));
        resource.piece_size = 700;
        http.serve(URL, resource);
        let store = Arc::new(MemoryChunkStore::new());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        RangeFetcher::new(http.clone(), store.clone(), 1_000, 4_000)
            .with_progress(Arc::new(move |p: Progress| sink_events.lock().push(p)))
            .fetch(URL)
            .await
            .unwrap();

        // Flushes happen at 4200 and 8400 buffered bytes, then at the end.
        let loaded: Vec<u64> = events.lock().iter().map(|p| p.loaded).collect();
        assert_eq!(loaded, vec![4_000, 8_000, 10_000]);
    }

    #[tokio::test]
    async fn resume_requests_missing_suffix() {
        let http = ScriptedHttp::new();
        let data = payload(10_000);
        http.serve(URL, FakeResource::new(data.clone()).failing_after(4_500));
        let store = Arc::new(MemoryChunkStore::new());

        let err = fetcher(&http, &store, 1_000).fetch(URL).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Network);
        let partial = store.metadata(URL).await.unwrap().unwrap();
        assert_eq!(partial.present_chunks(), 4);

        let meta = fetcher(&http, &store, 1_000).fetch(URL).await.unwrap();
        let requests = http.requests();
        assert_eq!(requests[1].range.as_deref(), Some("bytes=4000-"));
        assert_eq!(requests[1].if_range.as_deref(), Some("\"v1\""));
        assert_eq!(stored_bytes(&store, &meta).await, data.to_vec());
    }

    #[tokio::test]
    async fn changed_validator_on_partial_response_restarts() {
        let http = ScriptedHttp::new();
        http.serve(URL, FakeResource::new(payload(5_000)).failing_after(2_000));
        let store = Arc::new(MemoryChunkStore::new());
        fetcher(&http, &store, 1_000).fetch(URL).await.unwrap_err();

        let updated = payload(5_000).iter().map(|b| b ^ 0xff).collect::<Vec<u8>>();
        http.serve(
            URL,
            FakeResource::new(updated.clone().into())
                .with_validator(Some("\"v2\""))
                .ignoring_if_range(),
        );

        let meta = fetcher(&http, &store, 1_000).fetch(URL).await.unwrap();
        let ranges: Vec<Option<String>> = http.requests().into_iter().map(|r| r.range).collect();
        assert_eq!(ranges, vec![None, Some("bytes=2000-".into()), None]);
        assert_eq!(meta.validator.as_deref(), Some("\"v2\""));
        assert_eq!(stored_bytes(&store, &meta).await, updated);
    }

    #[tokio::test]
    async fn full_response_to_range_request_replaces_partial_state() {
        let http = ScriptedHttp::new();
        let data = payload(3_000);
        http.serve(URL, FakeResource::new(data.clone()).failing_after(1_500));
        let store = Arc::new(MemoryChunkStore::new());
        fetcher(&http, &store, 1_000).fetch(URL).await.unwrap_err();

        http.serve(URL, FakeResource::new(data.clone()).without_range_support());
        let meta = fetcher(&http, &store, 1_000).fetch(URL).await.unwrap();

        let requests = http.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].range.as_deref(), Some("bytes=1000-"));
        assert_eq!(stored_bytes(&store, &meta).await, data.to_vec());
    }

    #[tokio::test]
    async fn missing_length_is_a_network_error() {
        let http = ScriptedHttp::new();
        http.serve(URL, FakeResource::new(payload(10)).without_length());
        let store = Arc::new(MemoryChunkStore::new());

        let err = fetcher(&http, &store, 4).fetch(URL).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Network);
        assert!(store.metadata(URL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_body_is_a_size_mismatch() {
        let http = ScriptedHttp::new();
        http.serve(URL, FakeResource::new(payload(4_000)).declaring_len(5_000));
        let store = Arc::new(MemoryChunkStore::new());

        match fetcher(&http, &store, 1_000).fetch(URL).await {
            Err(DownloadError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 5_000);
                assert_eq!(actual, 4_000);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let partial = store.metadata(URL).await.unwrap().unwrap();
        assert!(!partial.is_complete());
    }

    #[tokio::test]
    async fn body_longer_than_declared_is_a_size_mismatch() {
        let http = ScriptedHttp::new();
        let mut resource = FakeResource::new(payload(4_000)).declaring_len(3_000);
        resource.piece_size = 500;
        http.serve(URL, resource);
        let store = Arc::new(MemoryChunkStore::new());

        match fetcher(&http, &store, 1_000).fetch(URL).await {
            Err(DownloadError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 3_000);
                assert_eq!(actual, 3_500);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Nothing past the declared length was written.
        let partial = store.metadata(URL).await.unwrap().unwrap();
        assert!(partial.present_chunks() <= 3);
        assert!(store.get_chunk(URL, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn resource_with_too_many_chunks_is_rejected() {
        let http = ScriptedHttp::new();
        http.serve(
            URL,
            FakeResource::new(payload(16)).declaring_len(u32::MAX as u64 + 1),
        );
        let store = Arc::new(MemoryChunkStore::new());

        let err = fetcher(&http, &store, 1).fetch(URL).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Store);
        assert!(store.metadata(URL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inconsistent_partial_response_is_range_not_supported() {
        let http = ScriptedHttp::new();
        http.serve(URL, FakeResource::new(payload(5_000)).failing_after(2_000));
        let store = Arc::new(MemoryChunkStore::new());
        fetcher(&http, &store, 1_000).fetch(URL).await.unwrap_err();
        let partial = store.metadata(URL).await.unwrap().unwrap();

        http.serve(
            URL,
            FakeResource::new(payload(5_000))
                .with_validator(Some("\"v2\""))
                .ignoring_if_range(),
        );
        let err = fetcher(&http, &store, 1_000).resume(partial).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RangeNotSupported);
        // The caller-facing path restarts instead of surfacing it.
        fetcher(&http, &store, 1_000).fetch(URL).await.unwrap();
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let http = ScriptedHttp::new();
        let store = Arc::new(MemoryChunkStore::new());
        match fetcher(&http, &store, 4).fetch(URL).await {
            Err(DownloadError::HttpStatus { status, .. }) => {
                assert_eq!(status, StatusCode::NOT_FOUND)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_record_skips_the_network() {
        let http = ScriptedHttp::new();
        http.serve(URL, FakeResource::new(payload(1_000)));
        let store = Arc::new(MemoryChunkStore::new());
        fetcher(&http, &store, 1_000).fetch(URL).await.unwrap();
        fetcher(&http, &store, 1_000).fetch(URL).await.unwrap();
        assert_eq!(http.requests().len(), 1);
    }

    #[tokio::test]
    async fn empty_resource_completes() {
        let http = ScriptedHttp::new();
        http.serve(URL, FakeResource::new(bytes::Bytes::new()));
        let store = Arc::new(MemoryChunkStore::new());
        let meta = fetcher(&http, &store, 1_000).fetch(URL).await.unwrap();
        assert_eq!(meta.total_chunks, 0);
        assert!(meta.is_complete());
    }

    #[tokio::test]
    async fn cancelled_fetch_is_aborted() {
        let http = ScriptedHttp::new();
        http.serve(URL, FakeResource::new(payload(1_000)));
        let store = Arc::new(MemoryChunkStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher(&http, &store, 100)
            .with_cancellation(cancel)
            .fetch(URL)
            .await
            .unwrap_err();
        assert!(err.is_aborted());
        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn halt_flag_stops_before_writing() {
        let http = ScriptedHttp::new();
        http.serve(URL, FakeResource::new(payload(1_000)));
        let store = Arc::new(MemoryChunkStore::new());

        let err = fetcher(&http, &store, 100)
            .with_halt_flag(Arc::new(AtomicBool::new(true)))
            .fetch(URL)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::StorageUnavailable);
        assert_eq!(store.chunk_count(), 0);
    }
}
