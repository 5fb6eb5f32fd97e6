//! Tracing-backed breadcrumb sink for the daemon.

use actionpack_core::sink::PackEventSink;
use tracing::warn;

/// Forwards executor breadcrumbs into the daemon's log stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl PackEventSink for TracingSink {
    fn event(&self, name: &str, detail: &str) {
        warn!(event = name, detail, "pack event");
    }
}
