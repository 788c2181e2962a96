//! Making sure a blob is present remotely and recently modified.

use crate::cancel::cancellable;
use crate::error::{CacheResult, ResultExt};
use crate::gateway::BlobStore;
use crate::progress::{ProgressReporter, TracingProgress, one_off};
use crate::touch::{TouchMethod, Toucher};
use std::sync::Arc;
use std::time::Duration;
use stowage_core::Descriptor;
use stowage_storage::{DEFAULT_READ_CHUNK_SIZE, Provider, section_stream};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// What [`FreshnessEngine::ensure_fresh`] had to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// The blob was missing and has been uploaded.
    Uploaded { bytes: u64 },
    /// The blob exists and was modified within the refresh window.
    Fresh,
    /// The blob existed but was stale, and has been touched.
    Touched(TouchMethod),
}

/// Uploads missing blobs and touches stale ones.
pub struct FreshnessEngine {
    blobs: BlobStore,
    toucher: Toucher,
    touch_refresh: Duration,
    progress: Arc<dyn ProgressReporter>,
    read_chunk_size: usize,
}

impl FreshnessEngine {
    pub fn new(blobs: BlobStore, touch_refresh: Duration) -> Self {
        let toucher = Toucher::new(blobs.store().clone());
        Self {
            blobs,
            toucher,
            touch_refresh,
            progress: Arc::new(TracingProgress),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_toucher(mut self, toucher: Toucher) -> Self {
        self.toucher = toucher;
        self
    }

    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size.max(1);
        self
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn touch_refresh(&self) -> Duration {
        self.touch_refresh
    }

    /// Ensure the blob described by `desc` is stored at `key` and fresh.
    ///
    /// A missing blob is read from `provider` and uploaded. A blob whose
    /// last-modified time is older than the refresh window, or unknown, is
    /// touched. Errors other than not-found from the existence check fail the
    /// blob without an upload.
    #[instrument(skip(self, cancel, provider, desc), fields(digest = %desc.digest))]
    pub async fn ensure_fresh(
        &self,
        cancel: &CancellationToken,
        key: &str,
        provider: &dyn Provider,
        desc: &Descriptor,
    ) -> CacheResult<Freshness> {
        let state = cancellable(cancel, self.blobs.state(key)).await?;

        if !state.exists {
            let bytes = self.upload(cancel, key, provider, desc).await?;
            return Ok(Freshness::Uploaded { bytes });
        }

        if let Some(last_modified) = state.last_modified
            && OffsetDateTime::now_utc() - last_modified <= self.touch_refresh
        {
            tracing::debug!(key = %key, %last_modified, "blob is fresh");
            return Ok(Freshness::Fresh);
        }

        let size = state.size.unwrap_or(desc.size);
        tracing::debug!(
            key = %key,
            size,
            last_modified = ?state.last_modified,
            "blob is stale, touching"
        );
        let method = self.toucher.touch(cancel, key, size).await?;
        Ok(Freshness::Touched(method))
    }

    async fn upload(
        &self,
        cancel: &CancellationToken,
        key: &str,
        provider: &dyn Provider,
        desc: &Descriptor,
    ) -> CacheResult<u64> {
        let event = one_off(self.progress.as_ref(), format!("writing layer {}", desc.digest));
        let result = cancellable(cancel, async {
            let reader = provider
                .reader_at(desc)
                .await
                .with_context(|| format!("failed to open blob {}", desc.digest))?;
            let body = section_stream(reader, desc.digest.to_string(), self.read_chunk_size);
            self.blobs
                .store()
                .put(key, body)
                .await
                .with_context(|| format!("failed to upload blob {} to {key}", desc.digest))
        })
        .await;

        if let Ok(bytes) = &result {
            tracing::info!(key = %key, bytes, "uploaded blob");
        }
        event.done(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyLayout;
    use stowage_storage::{MemoryBackend, MemoryProvider, ObjectStore};

    fn engine(backend: Arc<MemoryBackend>) -> FreshnessEngine {
        let blobs = BlobStore::new(backend, KeyLayout::new("", "manifests/", "blobs/"));
        FreshnessEngine::new(blobs, Duration::from_secs(24 * 3600))
    }

    #[tokio::test]
    async fn test_upload_then_fresh_then_touch() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone());
        let provider = MemoryProvider::new();
        let desc = provider.add("application/octet-stream", &b"layer content"[..]);
        let key = engine.blobs().blob_key(&desc.digest);
        let cancel = CancellationToken::new();

        let first = engine.ensure_fresh(&cancel, &key, &provider, &desc).await.unwrap();
        assert_eq!(first, Freshness::Uploaded { bytes: 13 });
        assert_eq!(
            backend.get_bytes(&key).await.unwrap().as_ref(),
            b"layer content"
        );

        let second = engine.ensure_fresh(&cancel, &key, &provider, &desc).await.unwrap();
        assert_eq!(second, Freshness::Fresh);

        backend.set_last_modified(&key, OffsetDateTime::now_utc() - time::Duration::days(2));
        let third = engine.ensure_fresh(&cancel, &key, &provider, &desc).await.unwrap();
        assert_eq!(third, Freshness::Touched(TouchMethod::Copy));
    }

    #[tokio::test]
    async fn test_missing_provider_content_fails_upload() {
        let backend = Arc::new(MemoryBackend::new());
        let engine = engine(backend.clone());
        let provider = MemoryProvider::new();
        let desc = Descriptor::new("x", stowage_core::Digest::sha256(b"absent"), 6);
        let key = engine.blobs().blob_key(&desc.digest);

        let err = engine
            .ensure_fresh(&CancellationToken::new(), &key, &provider, &desc)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to open blob"));
        assert!(backend.keys().is_empty());
    }
}
