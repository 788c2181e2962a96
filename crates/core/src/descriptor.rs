//! Content descriptors and the annotations the cache relies on.

use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Annotation carrying the digest of the uncompressed layer content.
pub const ANNOTATION_UNCOMPRESSED: &str = "containerd.io/uncompressed";

/// Annotation carrying the layer creation time (RFC 3339).
pub const ANNOTATION_CREATED_AT: &str = "buildkit/createdat";

/// Describes a blob: its digest, size, media type and free-form annotations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Create a descriptor without annotations.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: None,
        }
    }

    /// Add an annotation, creating the annotation map if needed.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Look up an annotation value.
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Parse the uncompressed-content digest annotation.
    ///
    /// A descriptor without annotations, or without the uncompressed digest,
    /// cannot be recorded in a manifest.
    pub fn uncompressed_digest(&self) -> crate::Result<Digest> {
        if self.annotations.is_none() {
            return Err(crate::Error::InvalidDescriptor(format!(
                "descriptor {} has no annotations",
                self.digest
            )));
        }
        let value = self.annotation(ANNOTATION_UNCOMPRESSED).ok_or_else(|| {
            crate::Error::InvalidDescriptor(format!(
                "descriptor {} has no uncompressed annotation",
                self.digest
            ))
        })?;
        Digest::parse(value).map_err(|e| {
            crate::Error::InvalidDescriptor(format!(
                "failed to parse uncompressed annotation of {}: {e}",
                self.digest
            ))
        })
    }

    /// Parse the optional creation time annotation.
    pub fn created_at(&self) -> crate::Result<Option<OffsetDateTime>> {
        self.annotation(ANNOTATION_CREATED_AT)
            .map(parse_timestamp)
            .transpose()
    }
}

/// Parse an RFC 3339 timestamp and normalize it to UTC.
pub fn parse_timestamp(value: &str) -> crate::Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|t| t.to_offset(time::UtcOffset::UTC))
        .map_err(|e| crate::Error::InvalidDescriptor(format!("invalid timestamp {value:?}: {e}")))
}

/// Format a timestamp as RFC 3339.
pub fn format_timestamp(value: OffsetDateTime) -> crate::Result<String> {
    value
        .format(&Rfc3339)
        .map_err(|e| crate::Error::Serialization(e.to_string()))
}
