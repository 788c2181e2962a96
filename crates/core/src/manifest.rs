//! Cache manifest types and the strict JSON codec.
//!
//! A manifest lists the layers of a cache chain in a fixed order together with
//! the cache records that reference them. Records belong to the build system's
//! cache graph and are carried through untouched.

use crate::descriptor::{
    ANNOTATION_CREATED_AT, ANNOTATION_UNCOMPRESSED, Descriptor, format_timestamp,
};
use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Parent index of a layer that sits at the bottom of a chain.
pub const NO_PARENT: i64 = -1;

fn no_parent() -> i64 {
    NO_PARENT
}

fn is_zero(size: &u64) -> bool {
    *size == 0
}

/// Provenance recorded for every layer of a finalized manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerAnnotations {
    #[serde(rename = "mediaType", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    /// Digest of the uncompressed layer content.
    #[serde(rename = "diffID", default, skip_serializing_if = "Option::is_none")]
    pub diff_id: Option<Digest>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(
        rename = "createdAt",
        default,
        with = "created_at",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<OffsetDateTime>,
}

/// RFC 3339 creation times. The year-one zero instant written by some
/// producers for layers without a creation time reads back as `None`.
mod created_at {
    use serde::{Deserializer, Serializer};
    use time::OffsetDateTime;
    use time::macros::datetime;

    pub(super) const ZERO_INSTANT: OffsetDateTime = datetime!(1-01-01 0:00 UTC);

    pub fn serialize<S: Serializer>(
        value: &Option<OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        time::serde::rfc3339::option::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<OffsetDateTime>, D::Error> {
        let value = time::serde::rfc3339::option::deserialize(deserializer)?;
        Ok(value.filter(|t| *t != ZERO_INSTANT))
    }
}

/// One layer of a cache chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLayer {
    pub blob: Digest,
    #[serde(rename = "parent", default = "no_parent")]
    pub parent_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<LayerAnnotations>,
}

impl CacheLayer {
    /// A layer with no parent and no annotations yet.
    pub fn new(blob: Digest) -> Self {
        Self {
            blob,
            parent_index: NO_PARENT,
            annotations: None,
        }
    }

    /// Rebuild the blob descriptor recorded for this layer.
    ///
    /// Fails if the layer has no annotations or no uncompressed digest: such a
    /// layer is corrupt rather than incomplete.
    pub fn descriptor(&self) -> crate::Result<Descriptor> {
        let annotations = self.annotations.as_ref().ok_or_else(|| {
            crate::Error::CorruptManifest(format!(
                "cache layer {} with missing annotations",
                self.blob
            ))
        })?;
        let diff_id = annotations.diff_id.as_ref().ok_or_else(|| {
            crate::Error::CorruptManifest(format!(
                "cache layer {} with missing diffID",
                self.blob
            ))
        })?;

        let mut desc = Descriptor::new(
            annotations.media_type.clone(),
            self.blob.clone(),
            annotations.size,
        )
        .with_annotation(ANNOTATION_UNCOMPRESSED, diff_id.to_string());
        if let Some(at) = annotations
            .created_at
            .filter(|t| *t != created_at::ZERO_INSTANT)
        {
            desc = desc.with_annotation(ANNOTATION_CREATED_AT, format_timestamp(at)?);
        }
        Ok(desc)
    }
}

/// Serialized description of a cache chain.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheManifest {
    #[serde(default)]
    pub layers: Vec<CacheLayer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<serde_json::Value>,
}

impl CacheManifest {
    /// True if the manifest describes no layers and no records.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.records.is_empty()
    }

    /// Serialize to JSON.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// Anything other than whitespace after the top-level object is rejected,
    /// which catches truncated or concatenated manifests.
    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        let mut de = serde_json::Deserializer::from_slice(data);
        let manifest = Self::deserialize(&mut de)
            .map_err(|e| crate::Error::CorruptManifest(format!("invalid manifest JSON: {e}")))?;
        de.end().map_err(|_| {
            crate::Error::CorruptManifest("unexpected data after JSON object".to_string())
        })?;
        Ok(manifest)
    }
}
