//! Importing a cache chain from the object store.

use crate::chain::{CacheChain, KeyStorageBuilder};
use crate::error::{CacheError, CacheResult};
use crate::gateway::BlobStore;
use crate::keys::KeyLayout;
use std::sync::Arc;
use stowage_core::CacheSettings;
use stowage_storage::{ObjectStore, Provider};
use tracing::instrument;

/// Reads the manifest under the first configured name.
#[derive(Clone, Debug)]
pub struct Importer {
    blobs: BlobStore,
    name: String,
}

impl Importer {
    pub fn new(settings: &CacheSettings, store: Arc<dyn ObjectStore>) -> CacheResult<Self> {
        settings
            .validate()
            .map_err(|e| CacheError::Config(e.to_string()))?;
        let name = settings.names.first().cloned().ok_or_else(|| {
            CacheError::Config("at least one manifest name is required".to_string())
        })?;
        Ok(Self {
            blobs: BlobStore::new(store, KeyLayout::from_settings(settings)),
            name,
        })
    }

    /// The manifest name read on import.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Load the chain. A missing manifest yields an empty chain.
    ///
    /// Layer content is not fetched here: every pair's provider reads the
    /// blob from the store on demand.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn load(&self) -> CacheResult<CacheChain> {
        let Some(manifest) = self.blobs.get_manifest(&self.name).await? else {
            tracing::info!(key = %self.blobs.manifest_key(&self.name), "no cache manifest found");
            return Ok(CacheChain::empty());
        };

        let provider: Arc<dyn Provider> = Arc::new(self.blobs.clone());
        let chain = CacheChain::from_manifest(manifest, provider)?;
        tracing::debug!(
            layers = chain.manifest.layers.len(),
            records = chain.manifest.records.len(),
            "loaded cache manifest"
        );
        Ok(chain)
    }

    /// Load the chain and hand it to `builder`.
    pub async fn resolve<B: KeyStorageBuilder>(&self, builder: B) -> CacheResult<B::Output> {
        let chain = self.load().await?;
        builder.build(chain)
    }
}
