//! In-memory object store.
//!
//! Keeps objects and in-flight multipart uploads in process memory. Used by
//! tests and by local dry runs of the cache; nothing survives the process.

use crate::abort::AbortOnDrop;
use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteRange, ByteStream, CompletedPart, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use time::OffsetDateTime;

/// Size of the chunks `get` yields.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// A stored object.
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Bytes,
    pub last_modified: OffsetDateTime,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

/// Object store backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<HashMap<String, StoredObject>>,
    uploads: Arc<Mutex<HashMap<String, PendingUpload>>>,
    next_upload_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored object.
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Overwrite the last-modified time of an object. Returns false if the
    /// object does not exist.
    pub fn set_last_modified(&self, key: &str, at: OffsetDateTime) -> bool {
        match self
            .objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(key)
        {
            Some(object) => {
                object.last_modified = at;
                true
            }
            None => false,
        }
    }

    /// Keys of all stored objects, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Number of multipart uploads neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn discard_upload(&self, upload_id: &str) {
        self.uploads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(upload_id);
    }

    fn insert(&self, key: &str, data: Bytes, metadata: HashMap<String, String>) {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                key.to_string(),
                StoredObject {
                    data,
                    last_modified: OffsetDateTime::now_utc(),
                    metadata,
                },
            );
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let object = self
            .object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectMeta {
            size: object.data.len() as u64,
            last_modified: Some(object.last_modified),
            content_type: None,
        })
    }

    async fn get(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        let object = self
            .object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let len = object.data.len() as u64;
        if offset > len {
            return Err(StorageError::InvalidRange(format!(
                "offset {offset} past end of {key} ({len} bytes)"
            )));
        }

        let rest = object.data.slice(offset as usize..);
        let chunks: Vec<StorageResult<Bytes>> = (0..rest.len())
            .step_by(READ_CHUNK_SIZE)
            .map(|start| Ok(rest.slice(start..(start + READ_CHUNK_SIZE).min(rest.len()))))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    /// Streams the body into a pending upload, like the S3 backend does, so
    /// a put dropped mid-body leaves a pending upload until its guard aborts it.
    async fn put(&self, key: &str, mut body: ByteStream) -> StorageResult<u64> {
        let upload_id = self.create_multipart(key).await?;
        let mut guard = {
            let uploads = self.uploads.clone();
            let id = upload_id.clone();
            AbortOnDrop::new(format!("{key}/{upload_id}"), async move {
                uploads.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            })
        };

        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(data) => buf.extend_from_slice(&data),
                Err(e) => {
                    guard.disarm();
                    self.discard_upload(&upload_id);
                    return Err(e);
                }
            }
        }

        guard.disarm();
        self.discard_upload(&upload_id);
        let written = buf.len() as u64;
        self.insert(key, buf.freeze(), HashMap::new());
        Ok(written)
    }

    async fn copy_replace_metadata(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> StorageResult<()> {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        object.metadata = metadata.clone();
        object.last_modified = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        let id = format!(
            "upload-{}",
            self.next_upload_id.fetch_add(1, Ordering::Relaxed)
        );
        self.uploads.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        range: ByteRange,
    ) -> StorageResult<CompletedPart> {
        let source = self
            .object(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let len = source.data.len() as u64;
        if range.end >= len {
            return Err(StorageError::InvalidRange(format!(
                "{range} outside {key} ({len} bytes)"
            )));
        }
        let data = source
            .data
            .slice(range.start as usize..=range.end as usize);

        let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::Multipart(format!("no such upload: {upload_id}")))?;
        let etag = format!("\"{upload_id}-{part_number}\"");
        upload.parts.insert(part_number, (etag.clone(), data));
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        let upload = {
            let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
            match uploads.get(upload_id) {
                Some(u) if u.key == key => uploads.remove(upload_id),
                _ => None,
            }
        }
        .ok_or_else(|| StorageError::Multipart(format!("no such upload: {upload_id}")))?;

        let mut buf = BytesMut::new();
        let mut previous = 0;
        for part in parts {
            if part.part_number <= previous {
                return Err(StorageError::Multipart(format!(
                    "parts out of order at part {}",
                    part.part_number
                )));
            }
            previous = part.part_number;
            match upload.parts.get(&part.part_number) {
                Some((etag, data)) if *etag == part.etag => buf.extend_from_slice(data),
                _ => {
                    return Err(StorageError::Multipart(format!(
                        "invalid part {} for upload {upload_id}",
                        part.part_number
                    )));
                }
            }
        }

        let metadata = self.object(key).map(|o| o.metadata).unwrap_or_default();
        self.insert(key, buf.freeze(), metadata);
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let mut uploads = self.uploads.lock().unwrap_or_else(|e| e.into_inner());
        match uploads.get(upload_id) {
            Some(u) if u.key == key => {
                uploads.remove(upload_id);
                Ok(())
            }
            _ => Err(StorageError::Multipart(format!(
                "no such upload: {upload_id}"
            ))),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
