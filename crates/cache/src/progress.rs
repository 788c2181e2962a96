//! Per-blob progress reporting.

use crate::error::{CacheError, CacheResult};
use std::time::Instant;

/// Receives one-off progress events.
pub trait ProgressReporter: Send + Sync {
    fn started(&self, id: &str);

    fn completed(&self, id: &str, error: Option<&CacheError>);
}

/// Reports progress events through `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingProgress;

impl ProgressReporter for TracingProgress {
    fn started(&self, id: &str) {
        tracing::info!(progress = %id, "started");
    }

    fn completed(&self, id: &str, error: Option<&CacheError>) {
        match error {
            None => tracing::info!(progress = %id, "done"),
            Some(e) => tracing::warn!(progress = %id, error = %e, "failed"),
        }
    }
}

/// A started one-off event. Finish it with [`OneOff::done`].
#[must_use = "a one-off progress event must be completed with done()"]
pub struct OneOff<'a> {
    reporter: &'a dyn ProgressReporter,
    id: String,
    started: Instant,
}

/// Start a one-off progress event.
pub fn one_off<'a>(reporter: &'a dyn ProgressReporter, id: impl Into<String>) -> OneOff<'a> {
    let id = id.into();
    reporter.started(&id);
    OneOff {
        reporter,
        id,
        started: Instant::now(),
    }
}

impl OneOff<'_> {
    /// Complete the event with the outcome of the operation and pass it on.
    pub fn done<T>(self, result: CacheResult<T>) -> CacheResult<T> {
        self.reporter.completed(&self.id, result.as_ref().err());
        tracing::debug!(
            progress = %self.id,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "progress event completed"
        );
        result
    }
}
