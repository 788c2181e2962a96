//! Descriptor/provider pairs and the imported cache chain.

use crate::error::{CacheError, CacheResult};
use std::collections::HashMap;
use std::sync::Arc;
use stowage_core::{CacheLayer, CacheManifest, Descriptor, Digest};
use stowage_storage::Provider;

/// A blob descriptor together with the provider its bytes come from.
#[derive(Clone)]
pub struct DescriptorProviderPair {
    pub descriptor: Descriptor,
    pub provider: Arc<dyn Provider>,
}

impl DescriptorProviderPair {
    pub fn new(descriptor: Descriptor, provider: Arc<dyn Provider>) -> Self {
        Self {
            descriptor,
            provider,
        }
    }
}

impl std::fmt::Debug for DescriptorProviderPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorProviderPair")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Rebuild the descriptor of a manifest layer and pair it with `provider`.
pub fn to_descriptor_provider_pair(
    layer: &CacheLayer,
    provider: Arc<dyn Provider>,
) -> CacheResult<DescriptorProviderPair> {
    let descriptor = layer
        .descriptor()
        .map_err(|e| CacheError::Corrupt(e.to_string()))?;
    Ok(DescriptorProviderPair::new(descriptor, provider))
}

/// A manifest read back from the store, with every layer resolvable to bytes.
#[derive(Clone, Debug, Default)]
pub struct CacheChain {
    pub manifest: CacheManifest,
    pub blobs: HashMap<Digest, DescriptorProviderPair>,
}

impl CacheChain {
    /// A chain with no layers and no records.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pair every layer of `manifest` with `provider`.
    pub fn from_manifest(manifest: CacheManifest, provider: Arc<dyn Provider>) -> CacheResult<Self> {
        let mut blobs = HashMap::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            let pair = to_descriptor_provider_pair(layer, provider.clone())?;
            blobs.insert(layer.blob.clone(), pair);
        }
        Ok(Self { manifest, blobs })
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    pub fn get(&self, digest: &Digest) -> Option<&DescriptorProviderPair> {
        self.blobs.get(digest)
    }
}

/// Builds the build system's cache-key storage from an imported chain.
pub trait KeyStorageBuilder {
    type Output;

    fn build(self, chain: CacheChain) -> CacheResult<Self::Output>;
}

impl<F, T> KeyStorageBuilder for F
where
    F: FnOnce(CacheChain) -> CacheResult<T>,
{
    type Output = T;

    fn build(self, chain: CacheChain) -> CacheResult<T> {
        self(chain)
    }
}
