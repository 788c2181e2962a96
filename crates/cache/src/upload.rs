//! Bounded-parallel materialization of manifest layers.
//!
//! Every layer index is queued once; a fixed number of workers drain the
//! queue, make each blob fresh remotely and derive its layer annotations.
//! The first failure cancels the whole group.

use crate::chain::DescriptorProviderPair;
use crate::error::{CacheError, CacheResult, ResultExt};
use crate::freshness::FreshnessEngine;
use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::{CacheLayer, Digest, LayerAnnotations};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

type Queue = Arc<Mutex<mpsc::Receiver<usize>>>;

/// Runs the freshness engine over all layers of a manifest.
#[derive(Clone)]
pub struct UploadCoordinator {
    engine: Arc<FreshnessEngine>,
    parallelism: usize,
}

impl UploadCoordinator {
    pub fn new(engine: Arc<FreshnessEngine>, parallelism: usize) -> CacheResult<Self> {
        if parallelism == 0 {
            return Err(CacheError::Config(
                "upload_parallelism must be a positive integer".to_string(),
            ));
        }
        Ok(Self {
            engine,
            parallelism,
        })
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn engine(&self) -> &Arc<FreshnessEngine> {
        &self.engine
    }

    /// Materialize every layer and return their annotations in layer order.
    ///
    /// Each layer is processed exactly once. On the first failure the
    /// remaining workers stop taking new layers, in-flight store calls are
    /// cancelled, and that failure is returned.
    #[instrument(skip_all, fields(layers = layers.len(), parallelism = self.parallelism))]
    pub async fn materialize_all(
        &self,
        cancel: &CancellationToken,
        layers: &[CacheLayer],
        descriptors: Arc<HashMap<Digest, DescriptorProviderPair>>,
    ) -> CacheResult<Vec<LayerAnnotations>> {
        let total = layers.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let (tx, rx) = mpsc::channel(total);
        for index in 0..total {
            tx.try_send(index)
                .map_err(|e| CacheError::Task(format!("failed to queue layer {index}: {e}")))?;
        }
        drop(tx);

        let queue: Queue = Arc::new(Mutex::new(rx));
        let blobs: Arc<Vec<Digest>> = Arc::new(layers.iter().map(|l| l.blob.clone()).collect());
        let group = cancel.child_token();

        let mut workers = JoinSet::new();
        for _ in 0..self.parallelism.min(total) {
            workers.spawn(worker(
                self.engine.clone(),
                queue.clone(),
                blobs.clone(),
                descriptors.clone(),
                group.clone(),
            ));
        }

        let mut slots: Vec<Option<LayerAnnotations>> = vec![None; total];
        let mut failure: Option<CacheError> = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    group.cancel();
                    Err(CacheError::Task(e.to_string()))
                }
            };
            match outcome {
                Ok(done) => {
                    for (index, annotations) in done {
                        slots[index] = Some(annotations);
                    }
                }
                Err(e) => {
                    let replace = failure
                        .as_ref()
                        .is_none_or(|first| first.is_cancelled() && !e.is_cancelled());
                    if replace {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| CacheError::Task(format!("layer {index} was not processed")))
            })
            .collect()
    }
}

async fn worker(
    engine: Arc<FreshnessEngine>,
    queue: Queue,
    blobs: Arc<Vec<Digest>>,
    descriptors: Arc<HashMap<Digest, DescriptorProviderPair>>,
    group: CancellationToken,
) -> CacheResult<Vec<(usize, LayerAnnotations)>> {
    let mut done = Vec::new();
    loop {
        if group.is_cancelled() {
            return Err(CacheError::Cancelled);
        }
        let next = queue.lock().await.recv().await;
        let Some(index) = next else {
            return Ok(done);
        };

        match materialize(&engine, &group, index, &blobs[index], &descriptors).await {
            Ok(annotations) => done.push((index, annotations)),
            Err(e) => {
                if !e.is_cancelled() {
                    tracing::warn!(layer = index, error = %e, "layer failed, cancelling siblings");
                }
                group.cancel();
                return Err(e);
            }
        }
    }
}

async fn materialize(
    engine: &FreshnessEngine,
    cancel: &CancellationToken,
    index: usize,
    blob: &Digest,
    descriptors: &HashMap<Digest, DescriptorProviderPair>,
) -> CacheResult<LayerAnnotations> {
    let pair = descriptors
        .get(blob)
        .ok_or_else(|| CacheError::MissingBlob(blob.clone()))?;
    let desc = &pair.descriptor;

    let diff_id = desc
        .uncompressed_digest()
        .map_err(|e| CacheError::Corrupt(e.to_string()))?;
    let created_at = desc
        .created_at()
        .map_err(|e| CacheError::Corrupt(e.to_string()))?;

    let key = engine.blobs().blob_key(&desc.digest);
    let outcome = engine
        .ensure_fresh(cancel, &key, pair.provider.as_ref(), desc)
        .await
        .with_context(|| format!("failed to materialize layer {index} ({blob})"))?;
    tracing::debug!(layer = index, key = %key, ?outcome, "layer materialized");

    Ok(LayerAnnotations {
        media_type: desc.media_type.clone(),
        diff_id: Some(diff_id),
        size: desc.size,
        created_at,
    })
}
