use crate::error::{CacheError, CacheResult};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Run `fut` unless `cancel` fires first.
///
/// An already-cancelled token short-circuits without polling `fut`.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> CacheResult<T>
where
    F: Future<Output = CacheResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(CacheError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CacheError::Cancelled),
        result = fut => result,
    }
}
