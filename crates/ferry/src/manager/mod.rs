//! # Download Manager
//!
//! Single entry point for making resources available in the response cache.
//!
//! [`DownloadManager::ensure`] first looks in the cache. On a miss it attaches
//! the caller to the in-flight download for the URL, or queues a new one.
//! Queued downloads start in FIFO order while fewer than
//! `max_concurrent_downloads` are running. A finished download is streamed out
//! of the chunk store into the cache, after which its chunks are dropped.
//!
//! When the persistent chunk store becomes unavailable the registered
//! [`QuotaHandler`] decides, once per manager, whether downloads fail or carry
//! on in process memory.

mod builder;
mod quota;
mod scheduler;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{ByteStream, CacheKey, CacheMetadata, CacheProvider};
use crate::config::ManagerConfig;
use crate::fetcher::RangeFetcher;
use crate::http::HttpClient;
use crate::progress::{Progress, ProgressSink};
use crate::store::{ChunkStore, ChunkStream, DownloadMetadata};
use crate::DownloadError;

pub use self::builder::DownloadManagerBuilder;
pub use self::quota::{QuotaContext, QuotaDecision, QuotaHandler};

use self::quota::QuotaNegotiator;
use self::scheduler::{SchedulerState, SinkSet, StartedTask};

/// Why a cached entry failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFailure {
    /// No entry for the URL.
    Missing,
    /// The stored payload does not have its declared length.
    SizeMismatch { declared: u64, actual: u64 },
}

/// Result of [`DownloadManager::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub ok: bool,
    pub reason: Option<VerifyFailure>,
}

impl VerifyReport {
    fn ok() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn failed(reason: VerifyFailure) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }
}

struct Inner {
    config: ManagerConfig,
    client: Arc<dyn HttpClient>,
    persistent: Option<Arc<dyn ChunkStore>>,
    memory: Arc<dyn ChunkStore>,
    cache: Arc<dyn CacheProvider>,
    memory_only: Arc<AtomicBool>,
    quota: QuotaNegotiator,
    scheduler: Mutex<SchedulerState>,
}

/// Deduplicating, bounded-concurrency download manager.
///
/// Cheap to clone; clones share the same queue, stores and cache.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn builder() -> DownloadManagerBuilder {
        DownloadManagerBuilder::new()
    }

    /// Make sure the full content of `url` is in the response cache.
    ///
    /// Concurrent calls for the same URL share one download; `progress`
    /// receives cumulative updates for whichever download serves this call.
    pub async fn ensure(
        &self,
        url: &str,
        progress: Option<ProgressSink>,
    ) -> Result<(), DownloadError> {
        validate_url(url)?;

        if self.cache_hit(url, progress.as_ref()).await? {
            return Ok(());
        }

        let (mut receiver, created) = self.inner.scheduler.lock().attach(url, progress);
        if created {
            debug!(url = %url, "Queued download");
            self.pump();
        } else {
            debug!(url = %url, "Attached to in-flight download");
        }

        match receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(DownloadError::aborted(url))),
            Err(_) => Err(DownloadError::aborted(url)),
        }
    }

    /// Cancel the download of `url`. Returns whether one was queued or running.
    ///
    /// A queued download is dropped before any request is made; a running one
    /// stops at its next read or chunk write. Attached callers fail with
    /// [`DownloadError::Aborted`]. An `ensure` issued after this call starts a
    /// fresh download once the cancelled one has wound down.
    pub fn cancel(&self, url: &str) -> bool {
        let mut scheduler = self.inner.scheduler.lock();
        if let Some(task) = scheduler.take_queued(url) {
            drop(scheduler);
            info!(url = %url, "Cancelled queued download");
            task.outcome.send_replace(Some(Err(DownloadError::aborted(url))));
            return true;
        }
        match scheduler.get(url) {
            Some(task) => {
                info!(url = %url, "Cancelling running download");
                task.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Check that the cached entry for `url` exists and has its declared length.
    pub async fn verify(&self, url: &str) -> Result<VerifyReport, DownloadError> {
        let report = match self.inner.cache.inspect(&CacheKey::new(url)).await? {
            None => VerifyReport::failed(VerifyFailure::Missing),
            Some(info) if info.is_intact() => VerifyReport::ok(),
            Some(info) => VerifyReport::failed(VerifyFailure::SizeMismatch {
                declared: info.metadata.size,
                actual: info.stored_size,
            }),
        };
        Ok(report)
    }

    /// Drop the cached entry and any partial download state for `url`.
    pub async fn evict(&self, url: &str) -> Result<(), DownloadError> {
        self.cancel_and_wait(url).await;

        self.inner.cache.remove(&CacheKey::new(url)).await?;
        if let Some(store) = &self.inner.persistent {
            store.delete_file(url).await?;
        }
        self.inner.memory.delete_file(url).await?;
        info!(url = %url, "Evicted");
        Ok(())
    }

    /// Verify `url` and download it again if the cached entry is missing or
    /// damaged. Returns the report from before the repair.
    pub async fn repair(
        &self,
        url: &str,
        progress: Option<ProgressSink>,
    ) -> Result<VerifyReport, DownloadError> {
        let report = self.verify(url).await?;
        if !report.ok {
            warn!(url = %url, reason = ?report.reason, "Cached entry failed verification, repairing");
            self.evict(url).await?;
            self.ensure(url, progress).await?;
        }
        Ok(report)
    }

    /// Wipe every partial download from the chunk stores.
    pub async fn clear_store(&self) -> Result<(), DownloadError> {
        if let Some(store) = &self.inner.persistent {
            store.clear_all().await?;
        }
        self.inner.memory.clear_all().await?;
        info!("Cleared chunk stores");
        Ok(())
    }

    /// Partially downloaded resources held by the chunk store in use.
    pub async fn pending(&self) -> Result<Vec<DownloadMetadata>, DownloadError> {
        let (store, _) = self.current_store();
        Ok(store.records().await?)
    }

    pub fn set_quota_handler(&self, handler: impl QuotaHandler + 'static) {
        self.inner.quota.set_handler(Arc::new(handler));
    }

    /// The storage decision made for this session, if any.
    pub fn quota_decision(&self) -> Option<QuotaDecision> {
        self.inner.quota.decision()
    }

    /// Whether downloads have been moved to process memory for this session.
    pub fn is_memory_only(&self) -> bool {
        self.inner.memory_only.load(Ordering::Acquire)
    }

    pub fn queued_len(&self) -> usize {
        self.inner.scheduler.lock().queued_len()
    }

    pub fn active_len(&self) -> usize {
        self.inner.scheduler.lock().active_len()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Start queued downloads while worker slots are free.
    fn pump(&self) {
        let limit = self.inner.config.max_concurrent_downloads.max(1);
        let started = self.inner.scheduler.lock().start_ready(limit);
        for task in started {
            let manager = self.clone();
            tokio::spawn(async move {
                let StartedTask {
                    id,
                    url,
                    sinks,
                    cancel,
                } = task;
                let result = manager.run_task(&url, &sinks, cancel).await;
                manager.complete(&url, id, result);
            });
        }
    }

    fn complete(&self, url: &str, id: u64, result: Result<(), DownloadError>) {
        match &result {
            Ok(()) => info!(url = %url, "Download finished"),
            Err(e) if e.is_aborted() => info!(url = %url, "Download aborted"),
            Err(e) => error!(url = %url, error = %e, "Download failed"),
        }

        let entry = self.inner.scheduler.lock().finish(url, id);
        if let Some(entry) = entry {
            entry.outcome.send_replace(Some(result));
        }
        self.pump();
    }

    async fn run_task(
        &self,
        url: &str,
        sinks: &SinkSet,
        cancel: CancellationToken,
    ) -> Result<(), DownloadError> {
        let progress = sinks.as_sink();
        // Another caller may have filled the cache while this task was queued.
        if self.cache_hit(url, Some(&progress)).await? {
            return Ok(());
        }
        info!(url = %url, "Starting download");

        loop {
            let (store, persistent) = self.current_store();
            let mut fetcher = RangeFetcher::new(
                self.inner.client.clone(),
                store.clone(),
                self.inner.config.chunk_size,
                self.inner.config.effective_flush_threshold(),
            )
            .with_cancellation(cancel.clone())
            .with_progress(progress.clone());
            if persistent {
                fetcher = fetcher.with_halt_flag(self.inner.memory_only.clone());
            }

            let result = match fetcher.fetch(url).await {
                Ok(_) => self.finalize(url, &store).await,
                Err(e) => Err(e),
            };

            match result {
                Err(DownloadError::StorageUnavailable {
                    reason,
                    quota_exceeded,
                }) if persistent => {
                    warn!(url = %url, reason = %reason, quota_exceeded, "Persistent chunk store unavailable");
                    let context = QuotaContext {
                        url: url.to_owned(),
                        quota_exceeded,
                        reason: reason.clone(),
                    };
                    let decision = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DownloadError::aborted(url)),
                        decision = self.inner.quota.negotiate(context) => decision,
                    };
                    match decision {
                        Some(QuotaDecision::ContinueInMemory) => {
                            self.enter_memory_only();
                            continue;
                        }
                        Some(QuotaDecision::Abort) | None => {
                            return Err(DownloadError::StorageUnavailable {
                                reason,
                                quota_exceeded,
                            });
                        }
                    }
                }
                other => return other,
            }
        }
    }

    /// Stream the stored chunks into the response cache, then drop them.
    async fn finalize(
        &self,
        url: &str,
        store: &Arc<dyn ChunkStore>,
    ) -> Result<(), DownloadError> {
        let stream = ChunkStream::open(store.clone(), url).await?;
        let metadata = CacheMetadata::new(stream.total_bytes())
            .with_content_type_option(stream.mime_type().map(str::to_owned))
            .with_validator_option(stream.validator().map(str::to_owned));
        let body: ByteStream = stream.map_err(std::io::Error::other).boxed();

        match self
            .inner
            .cache
            .put_stream(CacheKey::new(url), body, metadata)
            .await
        {
            Ok(written) => {
                info!(url = %url, bytes = written, "Committed to response cache");
                if let Err(e) = store.delete_file(url).await {
                    warn!(url = %url, error = %e, "Failed to drop chunks after finalizing");
                }
                Ok(())
            }
            Err(e) => {
                let err = DownloadError::from(e);
                if matches!(err, DownloadError::MissingChunk { .. }) {
                    warn!(url = %url, error = %err, "Stored download is incomplete, discarding it");
                    if let Err(e) = store.delete_file(url).await {
                        warn!(url = %url, error = %e, "Failed to discard incomplete download");
                    }
                }
                Err(err)
            }
        }
    }

    /// Resolve from the cache when an intact entry exists. A damaged entry is
    /// removed so it gets downloaded again.
    async fn cache_hit(
        &self,
        url: &str,
        progress: Option<&ProgressSink>,
    ) -> Result<bool, DownloadError> {
        let key = CacheKey::new(url);
        match self.inner.cache.inspect(&key).await? {
            Some(info) if info.is_intact() => {
                debug!(url = %url, size = info.stored_size, "Cache hit");
                if let Some(sink) = progress {
                    sink(Progress::complete(info.metadata.size));
                }
                Ok(true)
            }
            Some(info) => {
                warn!(
                    url = %url,
                    declared = info.metadata.size,
                    actual = info.stored_size,
                    "Cached entry has the wrong size, downloading again"
                );
                self.inner.cache.remove(&key).await?;
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// The chunk store new work goes to, and whether it is the persistent one.
    fn current_store(&self) -> (Arc<dyn ChunkStore>, bool) {
        match &self.inner.persistent {
            Some(store) if !self.is_memory_only() => (store.clone(), true),
            _ => (self.inner.memory.clone(), false),
        }
    }

    fn enter_memory_only(&self) {
        if !self.inner.memory_only.swap(true, Ordering::AcqRel) {
            warn!("Continuing downloads in memory for this session");
        }
    }

    async fn cancel_and_wait(&self, url: &str) {
        // A cancelled task may have a successor waiting behind it.
        loop {
            let receiver = self
                .inner
                .scheduler
                .lock()
                .get(url)
                .map(|task| task.outcome.subscribe());
            let Some(mut receiver) = receiver else {
                break;
            };
            self.cancel(url);
            let _ = receiver.wait_for(Option::is_some).await;
        }
    }
}

fn validate_url(url: &str) -> Result<(), DownloadError> {
    let parsed =
        url::Url::parse(url).map_err(|e| DownloadError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(DownloadError::InvalidUrl(format!(
            "{url}: unsupported scheme {scheme}"
        ))),
    }
}
