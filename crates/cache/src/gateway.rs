//! Blob store: the object store gateway bound to a key layout.

use crate::error::{CacheError, CacheResult, ResultExt};
use crate::keys::KeyLayout;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use stowage_core::{CacheManifest, Descriptor, Digest};
use stowage_storage::{ObjectStore, Provider, ReaderAt, RemoteReaderAt, StorageResult};
use time::OffsetDateTime;
use tracing::instrument;

/// What a head check found for a key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreObjectState {
    pub exists: bool,
    pub last_modified: Option<OffsetDateTime>,
    pub size: Option<u64>,
}

/// Object store plus key layout, shared read-only by every cache operation.
///
/// Also serves blob content by digest, which makes it the provider behind
/// every imported layer.
#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
    layout: KeyLayout,
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("backend", &self.store.backend_name())
            .field("layout", &self.layout)
            .finish()
    }
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>, layout: KeyLayout) -> Self {
        Self { store, layout }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    pub fn blob_key(&self, digest: &Digest) -> String {
        self.layout.blob_key(digest)
    }

    pub fn manifest_key(&self, name: &str) -> String {
        self.layout.manifest_key(name)
    }

    /// Head `key`. A missing object is a state, not an error.
    #[instrument(skip(self))]
    pub async fn state(&self, key: &str) -> CacheResult<StoreObjectState> {
        match self.store.head(key).await {
            Ok(meta) => Ok(StoreObjectState {
                exists: true,
                last_modified: meta.last_modified,
                size: Some(meta.size),
            }),
            Err(e) if e.is_not_found() => Ok(StoreObjectState::default()),
            Err(e) => Err(CacheError::from(e).context(format!("failed to check {key}"))),
        }
    }

    /// Read and decode the manifest stored under `name`.
    ///
    /// Returns `None` if no manifest exists under that name.
    #[instrument(skip(self))]
    pub async fn get_manifest(&self, name: &str) -> CacheResult<Option<CacheManifest>> {
        let key = self.manifest_key(name);
        let data = match self.store.get_bytes(&key).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => {
                return Err(CacheError::from(e).context(format!("failed to read manifest {key}")));
            }
        };

        let manifest = CacheManifest::decode(&data).map_err(|e| {
            CacheError::Corrupt(e.to_string()).context(format!("failed to decode manifest {key}"))
        })?;
        Ok(Some(manifest))
    }

    /// Encode and store a manifest under `name`, returning its key.
    #[instrument(skip(self, manifest), fields(layers = manifest.layers.len()))]
    pub async fn put_manifest(&self, name: &str, manifest: &CacheManifest) -> CacheResult<String> {
        let key = self.manifest_key(name);
        let data = manifest
            .encode()
            .with_context(|| format!("failed to encode manifest {key}"))?;
        self.store
            .put_bytes(&key, Bytes::from(data))
            .await
            .with_context(|| format!("failed to write manifest {key}"))?;
        tracing::debug!(key = %key, "wrote manifest");
        Ok(key)
    }

    /// Random-access reader over a stored blob.
    pub fn blob_reader(&self, digest: &Digest, size: u64) -> RemoteReaderAt {
        RemoteReaderAt::new(self.store.clone(), self.blob_key(digest), size)
    }
}

#[async_trait]
impl Provider for BlobStore {
    async fn reader_at(&self, desc: &Descriptor) -> StorageResult<Box<dyn ReaderAt>> {
        Ok(Box::new(self.blob_reader(&desc.digest, desc.size)))
    }
}
