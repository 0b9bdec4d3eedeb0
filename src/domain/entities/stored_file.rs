use std::fmt;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use crate::common::clock::{self, timestamp_format, TIMESTAMP_FORMAT};
use crate::common::errors::{Result, StorageError};
use crate::domain::repositories::payload::BoxAsyncRead;

/// Metadata attached to every stored blob.
///
/// This is also the exact shape of the local driver's `metadata.json`, so
/// field names and the timestamp wire format are part of the on-disk
/// contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub filename: String,
    pub content_type: String,
    pub content_length: u64,
    #[serde(with = "timestamp_format")]
    pub last_modified: DateTime<Utc>,
}

impl FileMetadata {
    pub fn new(filename: String, content_type: String, content_length: u64) -> Self {
        Self {
            filename,
            content_type,
            content_length,
            last_modified: clock::utc_now(),
        }
    }
}

type OpenFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<BoxAsyncRead>> + Send>;

enum ReaderState {
    /// The payload has not been touched yet; opening is deferred so that
    /// metadata-only consumers never pay for it.
    Unopened(OpenFn),
    Open(BoxAsyncRead),
    Closed,
}

/**
 * A file read back from a store.
 *
 * Stored files can only be read, sequentially and once: the handle reports
 * readable but not writable nor seekable. To replace the content of a file
 * go through the storage backend instead of writing to the handle.
 *
 * The underlying reader is opened lazily on the first `read`, and `close`
 * is final: reading a closed handle is an error.
 */
pub struct StoredFile {
    file_id: String,
    metadata: FileMetadata,
    public_url: Option<String>,
    state: ReaderState,
}

impl StoredFile {
    pub fn new<F, Fut>(
        file_id: impl Into<String>,
        metadata: FileMetadata,
        public_url: Option<String>,
        open: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<BoxAsyncRead>> + Send + 'static,
    {
        Self {
            file_id: file_id.into(),
            metadata,
            public_url,
            state: ReaderState::Unopened(Box::new(move || Box::pin(open()))),
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn filename(&self) -> &str {
        &self.metadata.filename
    }

    pub fn content_type(&self) -> &str {
        &self.metadata.content_type
    }

    pub fn content_length(&self) -> u64 {
        self.metadata.content_length
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.metadata.last_modified
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    /// Direct URL for stores whose backend serves HTTP natively.
    pub fn public_url(&self) -> Option<&str> {
        self.public_url.as_deref()
    }

    pub fn readable(&self) -> bool {
        true
    }

    pub fn writable(&self) -> bool {
        false
    }

    pub fn seekable(&self) -> bool {
        false
    }

    pub fn closed(&self) -> bool {
        matches!(self.state, ReaderState::Closed)
    }

    /// Entity tag derived from last-modified and length. Deterministic
    /// across processes as long as both stay stable.
    pub fn etag(&self) -> String {
        format!(
            "\"{}-{}\"",
            self.metadata.last_modified.format(TIMESTAMP_FORMAT),
            self.metadata.content_length
        )
    }

    async fn reader(&mut self) -> Result<&mut BoxAsyncRead> {
        if let ReaderState::Unopened(_) = self.state {
            let open = match std::mem::replace(&mut self.state, ReaderState::Closed) {
                ReaderState::Unopened(open) => open,
                _ => unreachable!(),
            };
            self.state = ReaderState::Open(open().await?);
        }

        match &mut self.state {
            ReaderState::Open(reader) => Ok(reader),
            ReaderState::Closed => Err(StorageError::backend(format!(
                "I/O operation on closed file {}",
                self.file_id
            ))),
            ReaderState::Unopened(_) => unreachable!(),
        }
    }

    /// Reads up to `n` bytes. An empty buffer signals end of content.
    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        let file_id = self.file_id.clone();
        let reader = self.reader().await?;
        let mut buf = BytesMut::zeroed(n);
        let read = reader.read(&mut buf).await.map_err(|e| {
            StorageError::backend(format!("read failed for file {}", file_id)).with_source(e)
        })?;
        buf.truncate(read);
        Ok(buf.freeze())
    }

    /// Reads the remaining content.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let file_id = self.file_id.clone();
        let reader = self.reader().await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.map_err(|e| {
            StorageError::backend(format!("read failed for file {}", file_id)).with_source(e)
        })?;
        Ok(buf.into())
    }

    /// Releases the underlying reader. Further reads fail.
    pub fn close(&mut self) {
        self.state = ReaderState::Closed;
    }

    /// Consumes the handle into a stream of fixed-size chunks, closing it
    /// when the stream ends or is dropped.
    pub fn into_chunks(
        mut self,
        chunk_size: usize,
    ) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
        async_stream::try_stream! {
            loop {
                let chunk = self.read(chunk_size).await?;
                if chunk.is_empty() {
                    break;
                }
                yield chunk;
            }
            self.close();
        }
    }
}

impl fmt::Debug for StoredFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredFile")
            .field("file_id", &self.file_id)
            .field("filename", &self.metadata.filename)
            .field("content_type", &self.metadata.content_type)
            .field("content_length", &self.metadata.content_length)
            .field("last_modified", &self.metadata.last_modified)
            .finish()
    }
}
