//! # Sled Chunk Store
//!
//! Durable chunk store on top of `sled`. Two trees are used:
//!
//! - `meta`: URL -> postcard-encoded [`DownloadMetadata`]
//! - `chunks`: URL bytes, a NUL separator, big-endian `u32` index -> payload
//!
//! The composite chunk key keeps every chunk of one URL in a contiguous key
//! range, so deleting a resource is a prefix scan. Writes that touch both trees
//! run in a single multi-tree transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree, Transactional, abort,
};
use sled::{IVec, Tree};
use tracing::{debug, info, warn};

use super::{ChunkStore, DownloadMetadata, StoreError, StoreResult, validate_chunk};

const META_TREE: &str = "meta";
const CHUNK_TREE: &str = "chunks";

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        let quota_exceeded = matches!(
            &err,
            sled::Error::Io(io) if io.kind() == std::io::ErrorKind::StorageFull
        );
        StoreError::Unavailable {
            reason: format!("sled: {err}"),
            quota_exceeded,
        }
    }
}

impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

impl From<TransactionError<StoreError>> for StoreError {
    fn from(err: TransactionError<StoreError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => e.into(),
        }
    }
}

fn chunk_prefix(url: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(url.len() + 1);
    key.extend_from_slice(url.as_bytes());
    key.push(0);
    key
}

fn chunk_key(url: &str, index: u32) -> Vec<u8> {
    let mut key = chunk_prefix(url);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn decode_meta(raw: &[u8]) -> StoreResult<DownloadMetadata> {
    Ok(postcard::from_bytes(raw)?)
}

fn encode_meta(meta: &DownloadMetadata) -> StoreResult<Vec<u8>> {
    Ok(postcard::to_allocvec(meta)?)
}

fn read_meta_tx(
    tree: &TransactionalTree,
    url: &str,
) -> Result<Option<DownloadMetadata>, ConflictableTransactionError<StoreError>> {
    match tree.get(url.as_bytes())? {
        Some(raw) => decode_meta(&raw)
            .map(Some)
            .map_err(ConflictableTransactionError::Abort),
        None => Ok(None),
    }
}

struct SledInner {
    db: sled::Db,
    meta: Tree,
    chunks: Tree,
    path: PathBuf,
    used_bytes: AtomicU64,
    quota: Option<u64>,
}

impl SledInner {
    fn chunk_keys(&self, url: &str) -> StoreResult<Vec<IVec>> {
        self.chunks
            .scan_prefix(chunk_prefix(url))
            .keys()
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    /// Removes the record and the listed chunk keys atomically; returns freed bytes.
    fn remove_record(&self, url: &str, keys: &[IVec]) -> StoreResult<u64> {
        let result: Result<u64, TransactionError<StoreError>> =
            (&self.meta, &self.chunks).transaction(|(meta, chunks)| {
                meta.remove(url.as_bytes())?;
                let mut freed = 0u64;
                for key in keys {
                    if let Some(old) = chunks.remove(key.clone())? {
                        freed += old.len() as u64;
                    }
                }
                Ok(freed)
            });
        let freed = result?;
        self.used_bytes.fetch_sub(freed, Ordering::AcqRel);
        Ok(freed)
    }

    fn init_file(&self, fresh: DownloadMetadata) -> StoreResult<DownloadMetadata> {
        let url = fresh.url.clone();
        let stale_keys = self.chunk_keys(&url)?;
        let encoded = encode_meta(&fresh)?;

        let result: Result<(DownloadMetadata, u64), TransactionError<StoreError>> =
            (&self.meta, &self.chunks).transaction(|(meta_tx, chunks_tx)| {
                if let Some(existing) = read_meta_tx(meta_tx, &url)? {
                    if existing.matches(
                        fresh.total_bytes,
                        fresh.validator.as_deref(),
                        fresh.chunk_size,
                    ) {
                        return Ok((existing, 0u64));
                    }
                }

                let mut freed = 0u64;
                for key in &stale_keys {
                    if let Some(old) = chunks_tx.remove(key.clone())? {
                        freed += old.len() as u64;
                    }
                }
                meta_tx.insert(url.as_bytes(), encoded.as_slice())?;
                Ok((fresh.clone(), freed))
            });
        let (meta, freed) = result?;

        if freed > 0 {
            self.used_bytes.fetch_sub(freed, Ordering::AcqRel);
            debug!(url = %url, freed, "Replaced stale download record");
        }
        Ok(meta)
    }

    fn reserve(&self, additional: u64) -> StoreResult<()> {
        let Some(quota) = self.quota else {
            self.used_bytes.fetch_add(additional, Ordering::AcqRel);
            return Ok(());
        };
        self.used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used + additional;
                (next <= quota).then_some(next)
            })
            .map(|_| ())
            .map_err(|used| StoreError::quota(used, additional, quota))
    }

    fn save_chunk(&self, url: &str, index: u32, data: &[u8]) -> StoreResult<()> {
        let key = chunk_key(url, index);
        let previous_len = self.chunks.get(&key)?.map_or(0, |v| v.len() as u64);
        let additional = (data.len() as u64).saturating_sub(previous_len);
        self.reserve(additional)?;

        let result: Result<(), TransactionError<StoreError>> =
            (&self.meta, &self.chunks).transaction(|(meta_tx, chunks_tx)| {
                let Some(mut meta) = read_meta_tx(meta_tx, url)? else {
                    return abort(StoreError::UnknownFile(url.to_owned()));
                };
                validate_chunk(&meta, index, data).map_err(ConflictableTransactionError::Abort)?;
                meta.chunk_presence.set(index);
                let encoded = encode_meta(&meta).map_err(ConflictableTransactionError::Abort)?;

                chunks_tx.insert(key.as_slice(), data)?;
                meta_tx.insert(url.as_bytes(), encoded)?;
                Ok(())
            });

        if let Err(err) = result {
            self.used_bytes.fetch_sub(additional, Ordering::AcqRel);
            return Err(err.into());
        }

        self.db.flush()?;
        Ok(())
    }
}

/// Chunk store persisted to a `sled` database directory.
#[derive(Clone)]
pub struct SledChunkStore {
    inner: Arc<SledInner>,
}

impl SledChunkStore {
    /// Open (or create) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_quota(path, None).await
    }

    /// Open the store, refusing chunk writes once `quota` payload bytes are stored.
    pub async fn open_with_quota(path: impl AsRef<Path>, quota: Option<u64>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(path, quota))
            .await
            .map_err(|e| StoreError::unavailable(format!("store open task failed: {e}")))?
    }

    fn open_blocking(path: PathBuf, quota: Option<u64>) -> StoreResult<Self> {
        let db = sled::open(&path)?;
        let meta = db.open_tree(META_TREE)?;
        let chunks = db.open_tree(CHUNK_TREE)?;

        let mut used = 0u64;
        for value in chunks.iter().values() {
            used += value?.len() as u64;
        }
        info!(path = %path.display(), records = meta.len(), used_bytes = used, "Opened chunk store");

        Ok(Self {
            inner: Arc::new(SledInner {
                db,
                meta,
                chunks,
                path,
                used_bytes: AtomicU64::new(used),
                quota,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Payload bytes currently held by the store.
    pub fn used_bytes(&self) -> u64 {
        self.inner.used_bytes.load(Ordering::Acquire)
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&SledInner) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| StoreError::unavailable(format!("store task failed: {e}")))?
    }
}

#[async_trait]
impl ChunkStore for SledChunkStore {
    async fn init_file(
        &self,
        url: &str,
        total_bytes: u64,
        mime_type: Option<String>,
        validator: Option<String>,
        chunk_size: u32,
    ) -> StoreResult<DownloadMetadata> {
        let fresh = DownloadMetadata::new(url, total_bytes, mime_type, validator, chunk_size)?;
        self.blocking(move |inner| inner.init_file(fresh)).await
    }

    async fn metadata(&self, url: &str) -> StoreResult<Option<DownloadMetadata>> {
        let url = url.to_owned();
        self.blocking(move |inner| match inner.meta.get(url.as_bytes())? {
            Some(raw) => decode_meta(&raw).map(Some),
            None => Ok(None),
        })
        .await
    }

    async fn records(&self) -> StoreResult<Vec<DownloadMetadata>> {
        self.blocking(|inner| {
            inner
                .meta
                .iter()
                .values()
                .map(|raw| decode_meta(&raw?))
                .collect()
        })
        .await
    }

    async fn save_chunk(&self, url: &str, index: u32, data: Bytes) -> StoreResult<()> {
        let url = url.to_owned();
        self.blocking(move |inner| inner.save_chunk(&url, index, &data))
            .await
    }

    async fn get_chunk(&self, url: &str, index: u32) -> StoreResult<Option<Bytes>> {
        let key = chunk_key(url, index);
        self.blocking(move |inner| {
            Ok(inner
                .chunks
                .get(key)?
                .map(|v| Bytes::copy_from_slice(&v)))
        })
        .await
    }

    async fn delete_file(&self, url: &str) -> StoreResult<()> {
        let url = url.to_owned();
        self.blocking(move |inner| {
            let keys = inner.chunk_keys(&url)?;
            let freed = inner.remove_record(&url, &keys)?;

            // The record is gone, so no new chunk for this URL can be committed;
            // sweep anything that landed between the scan and the transaction.
            let stragglers = inner.chunk_keys(&url)?;
            if !stragglers.is_empty() {
                warn!(url = %url, count = stragglers.len(), "Removing chunks written during delete");
                inner.remove_record(&url, &stragglers)?;
            }
            inner.db.flush()?;
            debug!(url = %url, chunks = keys.len(), freed, "Deleted download record");
            Ok(())
        })
        .await
    }

    async fn clear_all(&self) -> StoreResult<()> {
        self.blocking(|inner| {
            inner.meta.clear()?;
            inner.chunks.clear()?;
            inner.used_bytes.store(0, Ordering::Release);
            inner.db.flush()?;
            info!(path = %inner.path.display(), "Cleared chunk store");
            Ok(())
        })
        .await
    }

    fn is_persistent(&self) -> bool {
        true
    }
}
