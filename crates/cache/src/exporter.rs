//! Exporting a build's cache to the object store.

use crate::chain::DescriptorProviderPair;
use crate::error::{CacheError, CacheResult};
use crate::freshness::FreshnessEngine;
use crate::gateway::BlobStore;
use crate::keys::KeyLayout;
use crate::progress::{ProgressReporter, TracingProgress};
use crate::upload::UploadCoordinator;
use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::{CacheManifest, CacheSettings, Digest};
use stowage_storage::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Display name of the export operation.
pub const EXPORTER_NAME: &str = "exporting cache to Amazon S3";

/// What the build system hands over at export time.
#[derive(Clone, Debug, Default)]
pub struct ExportInput {
    /// Manifest skeleton: layers without annotations, plus opaque records.
    pub manifest: CacheManifest,
    /// Every blob the layers reference, by digest.
    pub descriptors: HashMap<Digest, DescriptorProviderPair>,
}

/// Writes blobs and the manifest for a build's cache.
pub struct Exporter {
    blobs: BlobStore,
    names: Vec<String>,
    coordinator: UploadCoordinator,
}

impl Exporter {
    pub fn new(settings: &CacheSettings, store: Arc<dyn ObjectStore>) -> CacheResult<Self> {
        Self::with_progress(settings, store, Arc::new(TracingProgress))
    }

    /// Build an exporter around a preconfigured engine.
    pub fn with_engine(
        engine: FreshnessEngine,
        names: Vec<String>,
        parallelism: usize,
    ) -> CacheResult<Self> {
        if names.is_empty() {
            return Err(CacheError::Config(
                "at least one manifest name is required".to_string(),
            ));
        }
        let blobs = engine.blobs().clone();
        let coordinator = UploadCoordinator::new(Arc::new(engine), parallelism)?;
        Ok(Self {
            blobs,
            names,
            coordinator,
        })
    }

    /// Same as [`Exporter::new`], reporting progress to `progress`.
    pub fn with_progress(
        settings: &CacheSettings,
        store: Arc<dyn ObjectStore>,
        progress: Arc<dyn ProgressReporter>,
    ) -> CacheResult<Self> {
        settings
            .validate()
            .map_err(|e| CacheError::Config(e.to_string()))?;
        let blobs = BlobStore::new(store, KeyLayout::from_settings(settings));
        let engine =
            FreshnessEngine::new(blobs, settings.touch_refresh).with_progress(progress);
        Self::with_engine(engine, settings.names.clone(), settings.upload_parallelism)
    }

    pub fn name(&self) -> &'static str {
        EXPORTER_NAME
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Materialize every layer blob, then write the annotated manifest under
    /// each configured name. Returns the manifest keys written.
    ///
    /// Nothing is written to the manifest keys if any layer fails.
    #[instrument(skip_all, fields(layers = input.manifest.layers.len()))]
    pub async fn finalize(
        &self,
        cancel: &CancellationToken,
        input: ExportInput,
    ) -> CacheResult<Vec<String>> {
        let ExportInput {
            mut manifest,
            descriptors,
        } = input;

        let annotations = self
            .coordinator
            .materialize_all(cancel, &manifest.layers, Arc::new(descriptors))
            .await?;
        for (layer, annotations) in manifest.layers.iter_mut().zip(annotations) {
            layer.annotations = Some(annotations);
        }

        let mut keys = Vec::with_capacity(self.names.len());
        for name in &self.names {
            if cancel.is_cancelled() {
                return Err(CacheError::Cancelled);
            }
            keys.push(self.blobs.put_manifest(name, &manifest).await?);
        }

        tracing::info!(
            layers = manifest.layers.len(),
            manifests = keys.len(),
            "exported cache"
        );
        Ok(keys)
    }
}
