//! Abort of in-flight multipart uploads whose owner was dropped.
//!
//! A streaming put that is cancelled mid-body is dropped at an await point,
//! after the store already initiated the upload. The guard spawns the abort
//! on the current runtime so the store does not keep orphaned parts.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

type AbortFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Runs an abort future when dropped while still armed.
#[must_use = "dropping the guard immediately aborts the upload"]
pub struct AbortOnDrop {
    label: String,
    // Mutex only to make the guard `Sync`; never contended.
    abort: Mutex<Option<AbortFuture>>,
}

impl AbortOnDrop {
    /// Arm a guard. `abort` is not polled unless the guard is dropped armed.
    pub fn new(label: impl Into<String>, abort: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            label: label.into(),
            abort: Mutex::new(Some(Box::pin(abort))),
        }
    }

    /// The upload finished or was aborted explicitly; do nothing on drop.
    pub fn disarm(&mut self) {
        *self.abort.get_mut().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_armed(&self) -> bool {
        self.abort
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl std::fmt::Debug for AbortOnDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortOnDrop")
            .field("label", &self.label)
            .field("armed", &self.is_armed())
            .finish()
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        let Some(abort) = self.abort.get_mut().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(upload = %self.label, "upload dropped, aborting");
                handle.spawn(abort);
            }
            Err(_) => tracing::warn!(
                upload = %self.label,
                "upload dropped outside a runtime, orphaned parts may remain"
            ),
        }
    }
}
