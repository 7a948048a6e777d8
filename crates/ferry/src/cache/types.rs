//! # Cache Types
//!
//! Types shared by every response cache provider.

use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Cache key for identifying a finished resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// URL of the resource
    pub url: String,
}

impl CacheKey {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Convert to a filename-safe string
    pub fn to_filename(&self) -> String {
        use sha2::{Digest, Sha256};

        let hash = Sha256::digest(self.url.as_bytes());
        format!("{hash:x}")
    }
}

/// Metadata for a cached resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the resource was cached (seconds since the Unix epoch)
    pub cached_at: u64,
    /// ETag or Last-Modified value the content was downloaded under
    pub validator: Option<String>,
    /// Content type of the resource
    pub content_type: Option<String>,
    /// Declared size of the resource in bytes
    pub size: u64,
}

impl CacheMetadata {
    /// Create new metadata for a resource
    pub fn new(size: u64) -> Self {
        Self {
            cached_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            validator: None,
            content_type: None,
            size,
        }
    }

    pub fn with_validator_option(mut self, validator: Option<String>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_type_option(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }
}

/// What a provider knows about an entry without reading its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    pub metadata: CacheMetadata,
    /// Number of payload bytes actually stored.
    pub stored_size: u64,
}

impl CacheEntryInfo {
    /// Whether the stored payload has the length its metadata declares.
    pub fn is_intact(&self) -> bool {
        self.stored_size == self.metadata.size
    }
}

/// Result of a cache operation
pub type CacheResult<T> = std::result::Result<T, std::io::Error>;

/// A type representing the result of a cache lookup operation
pub type CacheLookupResult = CacheResult<Option<(Bytes, CacheMetadata)>>;

/// Payload handed to [`put_stream`](super::CacheProvider::put_stream).
pub type ByteStream = BoxStream<'static, CacheResult<Bytes>>;

pub(crate) fn size_mismatch(expected: u64, actual: u64) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("declared {expected} bytes but received {actual}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_is_stable_hex_digest() {
        let a = CacheKey::new("https://cdn.example.com/model.onnx");
        let b = CacheKey::new("https://cdn.example.com/model.onnx");
        let c = CacheKey::new("https://cdn.example.com/model.onnx?v=2");
        assert_eq!(a.to_filename(), b.to_filename());
        assert_ne!(a.to_filename(), c.to_filename());
        assert_eq!(a.to_filename().len(), 64);
        assert!(a.to_filename().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn intact_compares_stored_and_declared_size() {
        let info = CacheEntryInfo {
            metadata: CacheMetadata::new(10),
            stored_size: 9,
        };
        assert!(!info.is_intact());
    }
}
