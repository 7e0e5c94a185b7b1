//! Per-instance lifecycle state machine.

use std::fmt;

use tracing::{debug, warn};

/// Where one instance is within a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Absent,
    Creating,
    Polling,
    Stable,
    Updating,
    Deleting,
    PollingAbsence,
    Failed,
}

impl Phase {
    /// Waiting on the remote side; a failure here aborts the machine.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Phase::Creating
                | Phase::Polling
                | Phase::Updating
                | Phase::Deleting
                | Phase::PollingAbsence
        )
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        if next == Phase::Failed {
            return self.is_in_flight();
        }
        matches!(
            (self, next),
            (Phase::Absent, Phase::Creating)
                | (Phase::Creating, Phase::Polling)
                | (Phase::Polling, Phase::Stable)
                | (Phase::Stable, Phase::Updating)
                | (Phase::Updating, Phase::Polling)
                | (Phase::Stable, Phase::Deleting)
                | (Phase::Deleting, Phase::PollingAbsence)
                | (Phase::PollingAbsence, Phase::Absent)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Absent => "absent",
            Phase::Creating => "creating",
            Phase::Polling => "polling",
            Phase::Stable => "stable",
            Phase::Updating => "updating",
            Phase::Deleting => "deleting",
            Phase::PollingAbsence => "polling-absence",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks one instance through its transitions and logs each of them.
#[derive(Debug)]
pub(crate) struct Machine<'a> {
    kind: &'a str,
    id: Option<String>,
    phase: Phase,
}

impl<'a> Machine<'a> {
    pub(crate) fn new(kind: &'a str, phase: Phase) -> Self {
        Self {
            kind,
            id: None,
            phase,
        }
    }

    pub(crate) fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub(crate) fn set_id(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    pub(crate) fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal transition {} -> {}",
            self.phase,
            next
        );
        debug!(
            kind = self.kind,
            id = self.id.as_deref().unwrap_or("<new>"),
            from = %self.phase,
            to = %next,
            "Lifecycle transition"
        );
        self.phase = next;
    }

    /// Abort on a non-retryable error or an unresolved poll.
    pub(crate) fn fail(&mut self, reason: &dyn fmt::Display) {
        warn!(
            kind = self.kind,
            id = self.id.as_deref().unwrap_or("<new>"),
            from = %self.phase,
            "Reconciliation aborted: {}",
            reason
        );
        if self.phase.is_in_flight() {
            self.phase = Phase::Failed;
        }
    }
}
