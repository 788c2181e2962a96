//! Refreshing the last-modified time of stored objects.
//!
//! An object is touched by copying it onto itself with replaced metadata.
//! Objects at or above the store's single-copy ceiling are copied part by
//! part through a multipart upload instead.

use crate::cancel::cancellable;
use crate::error::{CacheResult, ResultExt};
use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::MAX_COPY_OBJECT_SIZE;
use stowage_core::descriptor::format_timestamp;
use stowage_storage::{ByteRange, CompletedPart, ObjectStore};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// User metadata key carrying the time of the last touch.
pub const UPDATED_AT_METADATA: &str = "updated-at";

/// One part of a multipart copy, covering `[start, end]` inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyPart {
    pub part_number: i32,
    pub start: u64,
    pub end: u64,
}

impl CopyPart {
    pub fn range(&self) -> ByteRange {
        ByteRange {
            start: self.start,
            end: self.end,
        }
    }
}

fn copy_range_end(start: u64, size: u64, ceiling: u64) -> u64 {
    start
        .saturating_add(ceiling.saturating_sub(1))
        .min(size.saturating_sub(1))
}

/// Copy-source range header for the part starting at `start` of an object of
/// `size` bytes: `bytes=<start>-<min(start + 5 GiB - 1, size - 1)>`.
pub fn build_copy_source_range(start: u64, size: u64) -> String {
    format!(
        "bytes={}-{}",
        start,
        copy_range_end(start, size, MAX_COPY_OBJECT_SIZE)
    )
}

/// Parts of a multipart copy of an object of `size` bytes.
pub fn plan_copy_parts(size: u64) -> Vec<CopyPart> {
    plan_copy_parts_with_ceiling(size, MAX_COPY_OBJECT_SIZE)
}

/// Parts of `size` bytes split at most `ceiling` bytes each, numbered from 1.
pub fn plan_copy_parts_with_ceiling(size: u64, ceiling: u64) -> Vec<CopyPart> {
    let ceiling = ceiling.max(1);
    let mut parts = Vec::new();
    let mut start = 0u64;
    let mut part_number = 1i32;
    while start < size {
        let end = copy_range_end(start, size, ceiling);
        parts.push(CopyPart {
            part_number,
            start,
            end,
        });
        start = end + 1;
        part_number += 1;
    }
    parts
}

/// How an object was touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TouchMethod {
    /// A single metadata-replacing copy.
    Copy,
    /// A multipart copy with this many parts.
    Multipart { parts: usize },
}

/// Refreshes objects in place.
#[derive(Clone)]
pub struct Toucher {
    store: Arc<dyn ObjectStore>,
    max_copy_size: u64,
}

impl std::fmt::Debug for Toucher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Toucher")
            .field("backend", &self.store.backend_name())
            .field("max_copy_size", &self.max_copy_size)
            .finish()
    }
}

impl Toucher {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            max_copy_size: MAX_COPY_OBJECT_SIZE,
        }
    }

    /// Override the single-copy ceiling, for stores with a different limit.
    pub fn with_max_copy_size(mut self, max_copy_size: u64) -> Self {
        self.max_copy_size = max_copy_size.max(1);
        self
    }

    pub fn max_copy_size(&self) -> u64 {
        self.max_copy_size
    }

    /// Refresh the object at `key`, which is `size` bytes long.
    #[instrument(skip(self, cancel))]
    pub async fn touch(
        &self,
        cancel: &CancellationToken,
        key: &str,
        size: u64,
    ) -> CacheResult<TouchMethod> {
        if size < self.max_copy_size {
            let metadata = HashMap::from([(
                UPDATED_AT_METADATA.to_string(),
                format_timestamp(OffsetDateTime::now_utc())?,
            )]);
            cancellable(cancel, async {
                self.store
                    .copy_replace_metadata(key, &metadata)
                    .await
                    .with_context(|| format!("failed to touch {key}"))
            })
            .await?;
            tracing::debug!(key = %key, size, "touched object with copy");
            return Ok(TouchMethod::Copy);
        }

        let upload_id = cancellable(cancel, async {
            self.store
                .create_multipart(key)
                .await
                .with_context(|| format!("failed to start multipart copy of {key}"))
        })
        .await?;

        match self.copy_parts(cancel, key, &upload_id, size).await {
            Ok(parts) => {
                tracing::debug!(key = %key, size, parts, "touched object with multipart copy");
                Ok(TouchMethod::Multipart { parts })
            }
            Err(e) => {
                if let Err(abort_err) = self.store.abort_multipart(key, &upload_id).await {
                    tracing::warn!(
                        key = %key,
                        upload_id = %upload_id,
                        error = %abort_err,
                        "failed to abort multipart copy"
                    );
                }
                Err(e)
            }
        }
    }

    async fn copy_parts(
        &self,
        cancel: &CancellationToken,
        key: &str,
        upload_id: &str,
        size: u64,
    ) -> CacheResult<usize> {
        let plan = plan_copy_parts_with_ceiling(size, self.max_copy_size);
        let mut completed: Vec<CompletedPart> = Vec::with_capacity(plan.len());

        for part in &plan {
            let done = cancellable(cancel, async {
                self.store
                    .upload_part_copy(key, upload_id, part.part_number, part.range())
                    .await
                    .with_context(|| {
                        format!(
                            "failed to copy part {} ({}) of {key}",
                            part.part_number,
                            part.range()
                        )
                    })
            })
            .await?;
            completed.push(done);
        }

        cancellable(cancel, async {
            self.store
                .complete_multipart(key, upload_id, &completed)
                .await
                .with_context(|| format!("failed to complete multipart copy of {key}"))
        })
        .await?;

        Ok(completed.len())
    }
}
