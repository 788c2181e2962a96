//! Core domain types for the stowage remote build cache.
//!
//! This crate defines the data model shared by the other crates:
//! - Content digests
//! - Blob descriptors and their provenance annotations
//! - The cache manifest and its strict JSON codec
//! - Remote cache settings

pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod manifest;

pub use config::CacheSettings;
pub use descriptor::{ANNOTATION_CREATED_AT, ANNOTATION_UNCOMPRESSED, Descriptor};
pub use digest::{Algorithm, Digest};
pub use error::{Error, Result};
pub use manifest::{CacheLayer, CacheManifest, LayerAnnotations, NO_PARENT};

/// Largest object a single copy request may address (5 GiB).
pub const MAX_COPY_OBJECT_SIZE: u64 = 5 * 1024 * 1024 * 1024;
