//! Remote build cache on top of an object store.
//!
//! Export makes every layer blob present and fresh in the store, then writes
//! an annotated manifest under each configured name. Import reads the manifest
//! under the first name back into a [`CacheChain`] whose blobs are fetched
//! lazily from the store.

mod cancel;
pub mod chain;
pub mod error;
pub mod exporter;
pub mod freshness;
pub mod gateway;
pub mod importer;
pub mod keys;
pub mod progress;
pub mod touch;
pub mod upload;

pub use chain::{CacheChain, DescriptorProviderPair, KeyStorageBuilder, to_descriptor_provider_pair};
pub use error::{CacheError, CacheResult};
pub use exporter::{EXPORTER_NAME, ExportInput, Exporter};
pub use freshness::{Freshness, FreshnessEngine};
pub use gateway::{BlobStore, StoreObjectState};
pub use importer::Importer;
pub use keys::KeyLayout;
pub use progress::{OneOff, ProgressReporter, TracingProgress, one_off};
pub use touch::{
    CopyPart, TouchMethod, Toucher, UPDATED_AT_METADATA, build_copy_source_range, plan_copy_parts,
    plan_copy_parts_with_ceiling,
};
pub use upload::UploadCoordinator;
