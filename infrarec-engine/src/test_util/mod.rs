//! Test utilities: an in-memory control plane and an audit recorder.
//!
//! Used by the unit tests and by the integration tests under `tests/`.

pub mod memory_cloud;

use std::sync::Mutex;

pub use memory_cloud::{Call, CallKind, Lifecycle, MemoryCloud};

use crate::audit::{AuditEvent, AuditSink};

/// Keeps every audit event in memory.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for RecordingAudit {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
