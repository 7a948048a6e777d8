use std::sync::Arc;

use reqwest::StatusCode;

use crate::store::StoreError;

/// Coarse classification of a [`DownloadError`], for callers that only need to
/// pick a reaction (retry, offer degraded mode, give up).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    RangeNotSupported,
    SizeMismatch,
    StorageUnavailable,
    Aborted,
    MissingChunk,
    Cache,
    InvalidUrl,
    Store,
}

// Cloneable so that one outcome can be handed to every caller attached to the
// same download.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP request failed: {source}")]
    Http {
        #[source]
        source: Arc<reqwest::Error>,
    },

    #[error("Server returned status code {status} for {url}")]
    HttpStatus { url: String, status: StatusCode },

    #[error("Server did not honor range request for {url}: {reason}")]
    RangeNotSupported { url: String, reason: String },

    #[error("Size mismatch for {url}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("Storage unavailable: {reason}")]
    StorageUnavailable { reason: String, quota_exceeded: bool },

    #[error("Download aborted: {url}")]
    Aborted { url: String },

    #[error("Chunk {index} of {url} is missing from the store")]
    MissingChunk { url: String, index: u32 },

    #[error("Response cache error: {source}")]
    Cache {
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Chunk store error: {0}")]
    Store(String),
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::Network(_)
            | DownloadError::Http { .. }
            | DownloadError::HttpStatus { .. } => ErrorKind::Network,
            DownloadError::RangeNotSupported { .. } => ErrorKind::RangeNotSupported,
            DownloadError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            DownloadError::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            DownloadError::Aborted { .. } => ErrorKind::Aborted,
            DownloadError::MissingChunk { .. } => ErrorKind::MissingChunk,
            DownloadError::Cache { .. } => ErrorKind::Cache,
            DownloadError::InvalidUrl(_) => ErrorKind::InvalidUrl,
            DownloadError::Store(_) => ErrorKind::Store,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, DownloadError::Aborted { .. })
    }

    pub(crate) fn aborted(url: &str) -> Self {
        DownloadError::Aborted {
            url: url.to_owned(),
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        DownloadError::Http {
            source: Arc::new(err),
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        // Chunk store failures travel through the cache's io::Error channel
        // during finalization; unwrap them back into their own variants.
        if let Some(store_err) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<StoreError>())
        {
            return DownloadError::from(store_err.clone());
        }
        DownloadError::Cache {
            source: Arc::new(err),
        }
    }
}

impl From<StoreError> for DownloadError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable {
                reason,
                quota_exceeded,
            } => DownloadError::StorageUnavailable {
                reason,
                quota_exceeded,
            },
            StoreError::MissingChunk { url, index } => DownloadError::MissingChunk { url, index },
            other => DownloadError::Store(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_keep_their_kind() {
        let err = DownloadError::from(StoreError::Unavailable {
            reason: "quota".into(),
            quota_exceeded: true,
        });
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);

        let err = DownloadError::from(StoreError::MissingChunk {
            url: "https://host/a.bin".into(),
            index: 3,
        });
        assert_eq!(err.kind(), ErrorKind::MissingChunk);
    }

    #[test]
    fn store_error_survives_io_round_trip() {
        let io = std::io::Error::other(StoreError::MissingChunk {
            url: "https://host/a.bin".into(),
            index: 7,
        });
        match DownloadError::from(io) {
            DownloadError::MissingChunk { index, .. } => assert_eq!(index, 7),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn plain_io_errors_are_cache_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(DownloadError::from(io).kind(), ErrorKind::Cache);
    }
}
