//! Ordered, single-pass read of every chunk of one stored download.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use futures::stream::{self, BoxStream};

use super::{ChunkStore, DownloadMetadata, StoreError, StoreResult};

/// Yields the chunks of a download in index order.
///
/// A chunk whose presence bit is clear, or whose payload is gone, ends the
/// stream with [`StoreError::MissingChunk`]. Chunks are fetched lazily, so at
/// most one chunk is held in memory at a time.
pub struct ChunkStream {
    meta: DownloadMetadata,
    inner: BoxStream<'static, StoreResult<Bytes>>,
}

impl ChunkStream {
    pub async fn open(store: Arc<dyn ChunkStore>, url: &str) -> StoreResult<Self> {
        let meta = store
            .metadata(url)
            .await?
            .ok_or_else(|| StoreError::UnknownFile(url.to_owned()))?;

        let state = (store, meta.clone(), 0u32);
        let inner = stream::try_unfold(state, |(store, meta, index)| async move {
            if index >= meta.total_chunks {
                return Ok(None);
            }
            let missing = || StoreError::MissingChunk {
                url: meta.url.clone(),
                index,
            };
            if !meta.chunk_presence.get(index) {
                return Err(missing());
            }
            let chunk = store.get_chunk(&meta.url, index).await?.ok_or_else(missing)?;
            Ok(Some((chunk, (store, meta, index + 1))))
        });

        Ok(Self {
            meta,
            inner: Box::pin(inner),
        })
    }

    pub fn total_bytes(&self) -> u64 {
        self.meta.total_bytes
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.meta.mime_type.as_deref()
    }

    pub fn validator(&self) -> Option<&str> {
        self.meta.validator.as_deref()
    }
}

impl Stream for ChunkStream {
    type Item = StoreResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryChunkStore;
    use futures::{StreamExt, TryStreamExt};

    const URL: &str = "https://host/weights.bin";

    #[tokio::test]
    async fn missing_chunk_ends_stream_with_error() {
        let store = Arc::new(MemoryChunkStore::new());
        store.init_file(URL, 30, None, None, 10).await.unwrap();
        store.save_chunk(URL, 0, Bytes::from(vec![1; 10])).await.unwrap();
        store.save_chunk(URL, 2, Bytes::from(vec![3; 10])).await.unwrap();

        let mut stream = ChunkStream::open(store, URL).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().len(), 10);
        match stream.next().await {
            Some(Err(StoreError::MissingChunk { index, .. })) => assert_eq!(index, 1),
            other => panic!("unexpected item: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_url_cannot_be_opened() {
        let store = Arc::new(MemoryChunkStore::new());
        let err = ChunkStream::open(store, URL).await.err().unwrap();
        assert!(matches!(err, StoreError::UnknownFile(_)));
    }

    #[tokio::test]
    async fn empty_resource_yields_nothing() {
        let store = Arc::new(MemoryChunkStore::new());
        store
            .init_file(URL, 0, Some("text/plain".into()), None, 10)
            .await
            .unwrap();
        let stream = ChunkStream::open(store, URL).await.unwrap();
        assert_eq!(stream.mime_type(), Some("text/plain"));
        let parts: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert!(parts.is_empty());
    }
}
