//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads and uploads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
}

/// An inclusive byte range `[start, end]` of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Create a range, rejecting `end < start`.
    pub fn new(start: u64, end: u64) -> StorageResult<Self> {
        if end < start {
            return Err(StorageError::InvalidRange(format!(
                "end ({end}) < start ({start})"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: a range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl fmt::Display for ByteRange {
    /// HTTP range form, e.g. `bytes=0-1023`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end)
    }
}

/// A part returned by a multipart part copy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// 1-based part number.
    pub part_number: i32,
    /// Completion tag (ETag) the store returned for the part.
    pub etag: String,
}

/// Object store capability surface used by the remote cache.
///
/// Keys are full object keys; key layout (prefixes) is decided by the caller.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Get an object's size and last-modified time without fetching content.
    ///
    /// Returns [`StorageError::NotFound`] if the object does not exist.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Stream an object's content starting at `offset`.
    async fn get(&self, key: &str, offset: u64) -> StorageResult<ByteStream>;

    /// Upload an object from a byte stream, returning the bytes written.
    ///
    /// The object becomes visible only once the whole stream was stored.
    async fn put(&self, key: &str, body: ByteStream) -> StorageResult<u64>;

    /// Copy an object onto itself, replacing its user metadata.
    ///
    /// Stores refresh the last-modified time of the copy, which is what the
    /// cache relies on to keep objects alive.
    async fn copy_replace_metadata(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> StorageResult<()>;

    /// Start a multipart upload for `key`, returning the upload ID.
    async fn create_multipart(&self, key: &str) -> StorageResult<String>;

    /// Copy `range` of the existing object at `key` into part `part_number`
    /// of the upload.
    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        range: ByteRange,
    ) -> StorageResult<CompletedPart>;

    /// Complete a multipart upload from its parts in part-number order.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()>;

    /// Abort a multipart upload and discard its parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3", "memory").
    /// Used for logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }

    /// Fetch a whole object into memory.
    async fn get_bytes(&self, key: &str) -> StorageResult<Bytes> {
        let mut stream = self.get(key, 0).await?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Upload an in-memory object.
    async fn put_bytes(&self, key: &str, data: Bytes) -> StorageResult<u64> {
        self.put(key, Box::pin(futures::stream::once(async move { Ok(data) })))
            .await
    }
}
