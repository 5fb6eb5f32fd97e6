//! Breadcrumb sink for pack processing events.
//!
//! The executor reports coarse security-relevant events (for now, failed
//! signature verification) through this trait so the surrounding daemon
//! can forward them to whatever telemetry it carries, without this crate
//! depending on any particular backend.

/// Receiver for pack processing breadcrumbs.
pub trait PackEventSink: Send + Sync {
    /// Reports one event. `name` is a dotted event name such as
    /// `pack.verify.fail`; `detail` is a short free-form value (typically
    /// a pack id).
    fn event(&self, name: &str, detail: &str);
}

/// Sink that drops every event. Default for tests and embedding.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PackEventSink for NullSink {
    fn event(&self, _name: &str, _detail: &str) {}
}
