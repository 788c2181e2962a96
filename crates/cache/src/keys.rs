//! Object key layout.

use stowage_core::{CacheSettings, Digest};

/// Maps digests and manifest names to object keys.
///
/// Prefixes are concatenated verbatim, so a prefix that should act as a
/// directory must carry its own trailing slash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
    manifests_prefix: String,
    blobs_prefix: String,
}

impl KeyLayout {
    pub fn new(
        prefix: impl Into<String>,
        manifests_prefix: impl Into<String>,
        blobs_prefix: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            manifests_prefix: manifests_prefix.into(),
            blobs_prefix: blobs_prefix.into(),
        }
    }

    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(
            settings.prefix.clone(),
            settings.manifests_prefix.clone(),
            settings.blobs_prefix.clone(),
        )
    }

    /// `prefix + blobs_prefix + digest`
    pub fn blob_key(&self, digest: &Digest) -> String {
        format!("{}{}{}", self.prefix, self.blobs_prefix, digest)
    }

    /// `prefix + manifests_prefix + name`
    pub fn manifest_key(&self, name: &str) -> String {
        format!("{}{}{}", self.prefix, self.manifests_prefix, name)
    }
}
