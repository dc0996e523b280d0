//! Thin logging helper threaded through every component constructor so the
//! single structured log line required before cancellation (spec.md §7) is
//! written the same way regardless of which component raised the error.

use tracing::error;

use crate::error::CdcError;

/// Carries the component name ("source-mysql", "batcher", "metrics", ...)
/// so call sites don't repeat it at every log statement.
#[derive(Clone, Copy)]
pub struct LoggerHandle {
    component: &'static str,
}

impl LoggerHandle {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }

    /// Logs the one line spec.md requires before the cancellation token
    /// fires: component, error kind, and cursor in flight where known.
    /// Returns the error unchanged so it can sit at the end of a `?` chain.
    ///
    /// Only ever call this with an error `is_fatal()` agrees is fatal —
    /// `UpstreamTransient` is the Source Driver's own job to recover from
    /// in place (reconnect and resume), never something to hand up here.
    pub fn fatal(&self, err: CdcError) -> CdcError {
        debug_assert!(err.is_fatal(), "logged a non-fatal error as fatal: {err}");
        error!(component = self.component, kind = err.kind(), "{err}");
        err
    }
}
