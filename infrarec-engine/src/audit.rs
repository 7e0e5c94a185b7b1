//! Audit trail of changes the engine makes to remote objects.
//!
//! Non-blocking: sinks must return promptly and never fail the operation
//! that produced the event.

use tracing::{info, warn};

use crate::error::Operation;

/// One auditable change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    Created {
        kind: String,
        id: String,
    },
    Updated {
        kind: String,
        id: String,
        attributes: Vec<String>,
    },
    Replaced {
        kind: String,
        old_id: String,
        new_id: String,
    },
    Deleted {
        kind: String,
        id: String,
    },
    Drift {
        kind: String,
        id: String,
        detail: String,
    },
    Failed {
        kind: String,
        id: Option<String>,
        operation: Operation,
        reason: String,
    },
}

impl AuditEvent {
    /// Identifiers of the remote objects this event concerns.
    pub fn object_ids(&self) -> Vec<String> {
        match self {
            AuditEvent::Created { id, .. }
            | AuditEvent::Updated { id, .. }
            | AuditEvent::Deleted { id, .. }
            | AuditEvent::Drift { id, .. } => vec![id.clone()],
            AuditEvent::Replaced { old_id, new_id, .. } => vec![old_id.clone(), new_id.clone()],
            AuditEvent::Failed { id, .. } => id.iter().cloned().collect(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            AuditEvent::Created { kind, id } => format!("Created {} {}", kind, id),
            AuditEvent::Updated {
                kind,
                id,
                attributes,
            } => format!("Updated {} {} ({})", kind, id, attributes.join(", ")),
            AuditEvent::Replaced {
                kind,
                old_id,
                new_id,
            } => format!("Replaced {} {} with {}", kind, old_id, new_id),
            AuditEvent::Deleted { kind, id } => format!("Deleted {} {}", kind, id),
            AuditEvent::Drift { kind, id, detail } => {
                format!("Drift on {} {}: {}", kind, id, detail)
            }
            AuditEvent::Failed {
                kind,
                id,
                operation,
                reason,
            } => format!(
                "Failed to {} {} {}: {}",
                operation,
                kind,
                id.as_deref().unwrap_or("<new>"),
                reason
            ),
        }
    }
}

/// Receives audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events as tracing records under the `infrarec::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: AuditEvent) {
        let ids = event.object_ids();
        match &event {
            AuditEvent::Drift { .. } | AuditEvent::Failed { .. } => {
                warn!(target: "infrarec::audit", ?ids, "{}", event.message());
            }
            _ => info!(target: "infrarec::audit", ?ids, "{}", event.message()),
        }
    }
}

/// Discards events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _event: AuditEvent) {}
}
