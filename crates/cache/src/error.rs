//! Cache error types.

use stowage_core::Digest;
use stowage_storage::StorageError;
use thiserror::Error;

/// Errors raised by the remote cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Invalid or incomplete configuration. Raised before any network call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed manifest or descriptor data.
    #[error("corrupt cache data: {0}")]
    Corrupt(String),

    /// The export input has no descriptor for a layer blob.
    #[error("missing blob {0}")]
    MissingBlob(Digest),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] stowage_core::Error),

    /// The operation was cancelled, usually because a sibling task failed.
    #[error("operation cancelled")]
    Cancelled,

    #[error("task failed: {0}")]
    Task(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    /// Wrap this error with a description of the failed operation.
    pub fn context(self, context: impl Into<String>) -> Self {
        CacheError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through context wrappers.
    pub fn root(&self) -> &CacheError {
        match self {
            CacheError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True if the underlying cause is a missing object.
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), CacheError::Storage(e) if e.is_not_found())
    }

    /// True if the underlying cause is cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), CacheError::Cancelled)
    }
}

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Attach context to the error of a fallible cache operation.
pub(crate) trait ResultExt<T> {
    fn with_context<F, S>(self, f: F) -> CacheResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<CacheError>,
{
    fn with_context<F, S>(self, f: F) -> CacheResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_preserves_root() {
        let err: Result<(), StorageError> = Err(StorageError::NotFound("blobs/x".to_string()));
        let err = err.with_context(|| "failed to read blob").unwrap_err();
        assert_eq!(err.to_string(), "failed to read blob: object not found: blobs/x");
        assert!(err.is_not_found());
        assert!(!err.is_cancelled());

        let cancelled = CacheError::Cancelled.context("a").context("b");
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.to_string(), "b: a: operation cancelled");
    }
}
