//! # File Cache
//!
//! Durable cache provider. Each entry is a payload file named after the
//! SHA-256 of its URL plus a JSON `.meta` sidecar. Both are written under
//! temporary names and renamed into place, payload first, so an entry is
//! visible only once its metadata exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::StreamExt;
use tokio::fs;
use tokio::io::{self, AsyncWriteExt};
use tracing::{debug, warn};

use crate::cache::types::{
    ByteStream, CacheEntryInfo, CacheKey, CacheLookupResult, CacheMetadata, CacheResult,
    size_mismatch,
};

use super::CacheProvider;

const META_EXTENSION: &str = "meta";
const PARTIAL_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct FileCache {
    cache_dir: PathBuf,
    initialized: Arc<AtomicBool>,
}

impl FileCache {
    /// Create a new file cache with the specified directory
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Create the cache directory on first use
    pub(crate) async fn ensure_initialized(&self) -> io::Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        // create_dir_all tolerates concurrent callers racing here.
        fs::create_dir_all(&self.cache_dir).await?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    fn data_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(key.to_filename())
    }

    fn metadata_path(&self, key: &CacheKey) -> PathBuf {
        self.data_path(key).with_extension(META_EXTENSION)
    }

    fn partial_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    }

    async fn read_metadata(&self, key: &CacheKey) -> io::Result<Option<CacheMetadata>> {
        let meta_path = self.metadata_path(key);
        let metadata_bytes = match fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice(&metadata_bytes) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!(path = ?meta_path, error = %e, "Failed to parse cache metadata, dropping entry");
                self.remove_files(key).await?;
                Ok(None)
            }
        }
    }

    async fn remove_files(&self, key: &CacheKey) -> io::Result<()> {
        // Metadata first, so a half-removed entry is already invisible.
        for path in [self.metadata_path(key), self.data_path(key)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to remove cache file");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Stream `data` into `path`, returning the byte count.
    async fn write_stream(path: &Path, mut data: ByteStream) -> io::Result<u64> {
        let mut file = fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(part) = data.next().await {
            let part = part?;
            file.write_all(&part).await?;
            written += part.len() as u64;
        }
        file.sync_all().await?;
        Ok(written)
    }

    async fn commit(
        &self,
        key: &CacheKey,
        temp_data_path: &Path,
        metadata: &CacheMetadata,
    ) -> io::Result<()> {
        let data_path = self.data_path(key);
        let meta_path = self.metadata_path(key);
        let temp_meta_path = Self::partial_path(&meta_path);

        let metadata_json = serde_json::to_vec(&metadata).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize metadata: {e}"),
            )
        })?;
        fs::write(&temp_meta_path, &metadata_json).await?;

        // Drop any previous entry before the new payload replaces it.
        if let Err(e) = fs::remove_file(&meta_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                let _ = fs::remove_file(&temp_meta_path).await;
                return Err(e);
            }
        }

        if let Err(e) = fs::rename(temp_data_path, &data_path).await {
            warn!(from = ?temp_data_path, to = ?data_path, error = %e, "Failed to rename temporary data file");
            let _ = fs::remove_file(&temp_meta_path).await;
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_meta_path, &meta_path).await {
            warn!(from = ?temp_meta_path, to = ?meta_path, error = %e, "Failed to rename temporary metadata file");
            let _ = fs::remove_file(&data_path).await;
            let _ = fs::remove_file(&temp_meta_path).await;
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CacheProvider for FileCache {
    async fn get(&self, key: &CacheKey) -> CacheLookupResult {
        self.ensure_initialized().await?;

        let Some(metadata) = self.read_metadata(key).await? else {
            return Ok(None);
        };
        let data = match fs::read(self.data_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some((Bytes::from(data), metadata)))
    }

    async fn inspect(&self, key: &CacheKey) -> CacheResult<Option<CacheEntryInfo>> {
        self.ensure_initialized().await?;

        let Some(metadata) = self.read_metadata(key).await? else {
            return Ok(None);
        };
        let stored_size = match fs::metadata(self.data_path(key)).await {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        Ok(Some(CacheEntryInfo {
            metadata,
            stored_size,
        }))
    }

    async fn put(&self, key: CacheKey, data: Bytes, metadata: CacheMetadata) -> CacheResult<()> {
        let stream: ByteStream = futures::stream::once(async move { Ok(data) }).boxed();
        self.put_stream(key, stream, metadata).await.map(|_| ())
    }

    async fn put_stream(
        &self,
        key: CacheKey,
        data: ByteStream,
        metadata: CacheMetadata,
    ) -> CacheResult<u64> {
        self.ensure_initialized().await?;

        let temp_data_path = Self::partial_path(&self.data_path(&key));
        let written = match Self::write_stream(&temp_data_path, data).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&temp_data_path).await;
                return Err(e);
            }
        };

        if written != metadata.size {
            let _ = fs::remove_file(&temp_data_path).await;
            return Err(size_mismatch(metadata.size, written));
        }

        if let Err(e) = self.commit(&key, &temp_data_path, &metadata).await {
            let _ = fs::remove_file(&temp_data_path).await;
            return Err(e);
        }

        debug!(url = %key.url, size = written, "Cached entry to file");
        Ok(written)
    }

    async fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.ensure_initialized().await?;
        self.remove_files(key).await
    }
}
