use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use stowage_cache::{CacheError, DescriptorProviderPair, ExportInput, ProgressReporter};
use stowage_core::{
    ANNOTATION_CREATED_AT, ANNOTATION_UNCOMPRESSED, CacheLayer, CacheManifest, CacheSettings,
    Descriptor, Digest,
};
use stowage_storage::{MemoryProvider, Provider};

pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Generate deterministic test data using a seeded pseudo-random generator
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // Simple LCG (Linear Congruential Generator)
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Cache settings for an in-memory store.
pub fn settings() -> CacheSettings {
    CacheSettings::new("test-bucket", "us-east-1")
}

/// Add a blob to `provider` and return its descriptor with the annotations a
/// build system attaches to layers.
pub fn annotated_blob(provider: &MemoryProvider, seed: u64, len: usize) -> Descriptor {
    let data = seeded_bytes(seed, len);
    let diff_id = Digest::sha256(&[&data[..], &b"-uncompressed"[..]].concat());
    provider
        .add(LAYER_MEDIA_TYPE, data)
        .with_annotation(ANNOTATION_UNCOMPRESSED, diff_id.to_string())
        .with_annotation(ANNOTATION_CREATED_AT, "2024-06-01T12:00:00Z")
}

/// Export input with `count` chained layers, each backed by `provider`.
pub fn export_input(provider: Arc<MemoryProvider>, count: usize, len: usize) -> ExportInput {
    let mut layers = Vec::with_capacity(count);
    let mut descriptors = HashMap::new();
    let shared: Arc<dyn Provider> = provider.clone();
    for i in 0..count {
        let desc = annotated_blob(&provider, i as u64 + 1, len);
        let mut layer = CacheLayer::new(desc.digest.clone());
        layer.parent_index = i as i64 - 1;
        layers.push(layer);
        descriptors.insert(
            desc.digest.clone(),
            DescriptorProviderPair::new(desc, shared.clone()),
        );
    }

    ExportInput {
        manifest: CacheManifest {
            layers,
            records: vec![serde_json::json!({"digest": "sha256:record", "layers": [{"layer": 0}]})],
        },
        descriptors,
    }
}

/// Progress reporter that remembers every event.
#[derive(Default)]
pub struct RecordingProgress {
    pub events: Mutex<Vec<String>>,
}

impl ProgressReporter for RecordingProgress {
    fn started(&self, id: &str) {
        self.events.lock().unwrap().push(format!("start {id}"));
    }

    fn completed(&self, id: &str, error: Option<&CacheError>) {
        let outcome = if error.is_some() { "error" } else { "ok" };
        self.events.lock().unwrap().push(format!("{outcome} {id}"));
    }
}
