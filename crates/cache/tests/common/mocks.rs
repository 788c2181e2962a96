use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use stowage_storage::error::{StorageError, StorageResult};
use stowage_storage::traits::{ByteRange, ByteStream, CompletedPart, ObjectMeta, ObjectStore};
use stowage_storage::MemoryBackend;
use time::OffsetDateTime;
use tokio::time::Duration;

/// A store call, as seen by [`RecordingStore`].
#[allow(dead_code)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Head(String),
    Get(String, u64),
    Put(String),
    CopyReplace(String),
    CreateMultipart(String),
    PartCopy {
        key: String,
        part_number: i32,
        range: ByteRange,
    },
    Complete {
        key: String,
        parts: Vec<i32>,
    },
    Abort(String),
}

/// A fault to inject into a store call.
#[allow(dead_code)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    Head(String),
    Put(String),
    PartCopy(i32),
    Complete,
    Abort,
}

/// An object known only by its metadata, for sizes too large to store.
#[derive(Clone, Debug)]
struct VirtualObject {
    size: u64,
    last_modified: Option<OffsetDateTime>,
}

/// Object store that records every call, injects faults and delays, and can
/// report huge objects without holding their bytes.
///
/// Everything that is not virtual or faulted is delegated to a [`MemoryBackend`].
#[allow(dead_code)]
pub struct RecordingStore {
    pub inner: MemoryBackend,
    calls: Mutex<Vec<Call>>,
    faults: Mutex<Vec<Fault>>,
    virtual_objects: Mutex<HashMap<String, VirtualObject>>,
    put_delays: Mutex<HashMap<String, Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_virtual_upload: AtomicUsize,
}

#[allow(dead_code)]
impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            virtual_objects: Mutex::new(HashMap::new()),
            put_delays: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            next_virtual_upload: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn puts(&self) -> usize {
        self.count(|c| matches!(c, Call::Put(_)))
    }

    pub fn puts_for(&self, key: &str) -> usize {
        self.count(|c| matches!(c, Call::Put(k) if k == key))
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().unwrap().push(fault);
    }

    /// Delay `put` for `key` before it reaches the inner store.
    pub fn delay_put(&self, key: &str, delay: Duration) {
        self.put_delays
            .lock()
            .unwrap()
            .insert(key.to_string(), delay);
    }

    /// Report an object of `size` bytes at `key` without storing it.
    pub fn add_virtual(&self, key: &str, size: u64, last_modified: Option<OffsetDateTime>) {
        self.virtual_objects.lock().unwrap().insert(
            key.to_string(),
            VirtualObject {
                size,
                last_modified,
            },
        );
    }

    pub fn virtual_last_modified(&self, key: &str) -> Option<OffsetDateTime> {
        self.virtual_objects
            .lock()
            .unwrap()
            .get(key)
            .and_then(|o| o.last_modified)
    }

    /// Highest number of concurrent `put` calls observed.
    pub fn max_concurrent_puts(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn faulted(&self, fault: &Fault) -> bool {
        self.faults.lock().unwrap().contains(fault)
    }

    fn is_virtual(&self, key: &str) -> bool {
        self.virtual_objects.lock().unwrap().contains_key(key)
    }

    fn injected(what: &str) -> StorageError {
        StorageError::Io(std::io::Error::other(format!("injected {what} failure")))
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.record(Call::Head(key.to_string()));
        if self.faulted(&Fault::Head(key.to_string())) {
            return Err(Self::injected("head"));
        }
        let virtual_object = self.virtual_objects.lock().unwrap().get(key).cloned();
        if let Some(object) = virtual_object {
            return Ok(ObjectMeta {
                size: object.size,
                last_modified: object.last_modified,
                content_type: None,
            });
        }
        self.inner.head(key).await
    }

    async fn get(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        self.record(Call::Get(key.to_string(), offset));
        self.inner.get(key, offset).await
    }

    async fn put(&self, key: &str, body: ByteStream) -> StorageResult<u64> {
        self.record(Call::Put(key.to_string()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.put_delays.lock().unwrap().get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = if self.faulted(&Fault::Put(key.to_string())) {
            Err(Self::injected("put"))
        } else {
            self.inner.put(key, body).await
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn copy_replace_metadata(
        &self,
        key: &str,
        metadata: &HashMap<String, String>,
    ) -> StorageResult<()> {
        self.record(Call::CopyReplace(key.to_string()));
        if let Some(object) = self.virtual_objects.lock().unwrap().get_mut(key) {
            object.last_modified = Some(OffsetDateTime::now_utc());
            return Ok(());
        }
        self.inner.copy_replace_metadata(key, metadata).await
    }

    async fn create_multipart(&self, key: &str) -> StorageResult<String> {
        self.record(Call::CreateMultipart(key.to_string()));
        if self.is_virtual(key) {
            let n = self.next_virtual_upload.fetch_add(1, Ordering::SeqCst);
            return Ok(format!("virtual-{n}"));
        }
        self.inner.create_multipart(key).await
    }

    async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        range: ByteRange,
    ) -> StorageResult<CompletedPart> {
        self.record(Call::PartCopy {
            key: key.to_string(),
            part_number,
            range,
        });
        if self.faulted(&Fault::PartCopy(part_number)) {
            return Err(Self::injected("part copy"));
        }
        if self.is_virtual(key) {
            return Ok(CompletedPart {
                part_number,
                etag: format!("\"{upload_id}-{part_number}\""),
            });
        }
        self.inner
            .upload_part_copy(key, upload_id, part_number, range)
            .await
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        self.record(Call::Complete {
            key: key.to_string(),
            parts: parts.iter().map(|p| p.part_number).collect(),
        });
        if self.faulted(&Fault::Complete) {
            return Err(Self::injected("complete"));
        }
        if let Some(object) = self.virtual_objects.lock().unwrap().get_mut(key) {
            object.last_modified = Some(OffsetDateTime::now_utc());
            return Ok(());
        }
        self.inner.complete_multipart(key, upload_id, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        self.record(Call::Abort(key.to_string()));
        if self.faulted(&Fault::Abort) {
            return Err(Self::injected("abort"));
        }
        if self.is_virtual(key) {
            return Ok(());
        }
        self.inner.abort_multipart(key, upload_id).await
    }

    fn backend_name(&self) -> &'static str {
        "recording"
    }
}
