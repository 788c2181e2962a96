//! Object storage gateway and byte providers for Stowage.
//!
//! This crate provides:
//! - The [`ObjectStore`] capability surface the remote cache needs: head,
//!   ranged get, streaming put, metadata-replace copy and multipart copy
//! - Backends: S3-compatible and in-memory
//! - Random-access [`ReaderAt`] / [`Provider`] abstractions for blob content

pub mod abort;
pub mod backends;
pub mod error;
pub mod provider;
pub mod reader;
pub mod traits;

pub use abort::AbortOnDrop;
pub use backends::{memory::MemoryBackend, s3::S3Backend};
pub use error::{StorageError, StorageResult};
pub use provider::{
    BytesReaderAt, DEFAULT_READ_CHUNK_SIZE, DirectoryProvider, MemoryProvider, Provider, ReaderAt,
    section_stream,
};
pub use reader::RemoteReaderAt;
pub use traits::{ByteRange, ByteStream, CompletedPart, ObjectMeta, ObjectStore};

use std::sync::Arc;
use stowage_core::CacheSettings;

/// Create the S3 object store described by cache settings.
pub fn from_settings(settings: &CacheSettings) -> StorageResult<Arc<dyn ObjectStore>> {
    let backend = S3Backend::new(settings)?;
    tracing::debug!(
        bucket = %settings.bucket,
        region = %settings.region,
        endpoint = settings.endpoint_url.as_deref().unwrap_or("default"),
        "created S3 object store"
    );
    Ok(Arc::new(backend))
}
