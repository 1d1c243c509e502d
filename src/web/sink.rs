//! Access-log sinks for the admission layer.

use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{info, warn};

/// Fire-and-forget destination for access-log lines.
pub trait LogSink: Send + Sync {
    fn log(&self, message: &str);
}

/// Writes each line as an `info` event under the `gatekeeper::access` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str) {
        info!(target: "gatekeeper::access", "{}", message);
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn log(&self, _message: &str) {}
}

/// Deliver `message` to `sink`; a panicking sink loses the line and nothing else.
pub(crate) fn emit(sink: &dyn LogSink, message: &str) {
    if catch_unwind(AssertUnwindSafe(|| sink.log(message))).is_err() {
        warn!("Log sink panicked, message dropped");
    }
}
