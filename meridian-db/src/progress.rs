//! Reporting callbacks handed in by non-core callers.
//!
//! The import pipeline reports long-running actions and malformed input
//! through these traits; they observe progress but cannot abort.

use crate::ObjectOsmRef;
use tracing::{debug, error, info, warn};

/// Progress reporter for long-running operations.
pub trait Progress: Send + Sync {
    fn set_action(&self, action: &str);

    fn set_progress(&self, current: u64, max: u64);

    fn info(&self, message: &str);
    fn warning(&self, message: &str);
    fn error(&self, message: &str);

    /// Whether the caller wants debug-level output; expensive diagnostics are
    /// gated on this.
    fn output_debug(&self) -> bool {
        false
    }

    fn debug(&self, _message: &str) {}
}

/// Default reporter routing everything through `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgress {
    pub with_debug: bool,
}

impl Progress for TracingProgress {
    fn set_action(&self, action: &str) {
        info!("{action}");
    }

    fn set_progress(&self, current: u64, max: u64) {
        // Only log the coarse steps; per-record progress would flood the log.
        if max > 0 && current % (max / 10).max(1) == 0 {
            debug!("{current}/{max}");
        }
    }

    fn info(&self, message: &str) {
        info!("{message}");
    }

    fn warning(&self, message: &str) {
        warn!("{message}");
    }

    fn error(&self, message: &str) {
        error!("{message}");
    }

    fn output_debug(&self) -> bool {
        self.with_debug
    }

    fn debug(&self, message: &str) {
        debug!("{message}");
    }
}

/// Reporter that swallows everything; used by tests.
#[derive(Debug, Default)]
pub struct SilentProgress;

impl Progress for SilentProgress {
    fn set_action(&self, _action: &str) {}
    fn set_progress(&self, _current: u64, _max: u64) {}
    fn info(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Callback for malformed tag values encountered by feature parsers.
pub trait TagErrorReporter: Send + Sync {
    fn report_tag(&self, object: &ObjectOsmRef, key: &str, value: &str, message: &str);
}

/// Default tag error reporter logging through `tracing`.
#[derive(Debug, Default)]
pub struct TracingTagErrorReporter;

impl TagErrorReporter for TracingTagErrorReporter {
    fn report_tag(&self, object: &ObjectOsmRef, key: &str, value: &str, message: &str) {
        warn!("{object}: tag {key}={value}: {message}");
    }
}

/// Tag error reporter that swallows everything; used by tests.
#[derive(Debug, Default)]
pub struct SilentTagErrorReporter;

impl TagErrorReporter for SilentTagErrorReporter {
    fn report_tag(&self, _object: &ObjectOsmRef, _key: &str, _value: &str, _message: &str) {}
}
