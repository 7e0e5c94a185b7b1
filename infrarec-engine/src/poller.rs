//! State poller: waits for a remote object to reach a terminal lifecycle
//! state, backing off exponentially between reads.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Observation;
use crate::error::ClientError;
use crate::schema::LifecycleState;

/// Timeouts longer than this mean "no timeout".
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `now + timeout` without overflowing on huge timeouts.
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now + timeout.min(FAR_FUTURE)
}

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Total time to wait before giving up with `TimedOut`.
    pub timeout: Duration,
    /// Delay after the first non-terminal read.
    pub initial_interval: Duration,
    /// Upper bound for the doubling delay.
    pub max_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20 * 60),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        }
    }
}

/// Caller-side controls for one operation: a cancellation token and an
/// optional deadline. Both win over the poller's own timeout.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(deadline_after(Instant::now(), timeout))
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The earlier of the caller's deadline and `own`.
    pub fn effective_deadline(&self, own: Instant) -> Instant {
        match self.deadline {
            Some(d) if d < own => d,
            _ => own,
        }
    }
}

/// What a not-found read means for this poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundPolicy {
    /// The object is not visible yet (eventual consistency after create).
    Pending,
    /// The object is gone; success when confirming a delete.
    Absent,
    /// The object vanished under us.
    Drift,
}

/// Why a poll failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollFailure {
    /// A permanent error from the client.
    Rejected(ClientError),
    /// The object reached a terminal failure state.
    FailedState(LifecycleState),
    /// The object disappeared while it was expected to exist.
    Vanished,
}

/// Terminal outcome of a poll sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    Success(Observation),
    /// Not-found while confirming a delete.
    Absent,
    /// Deadline reached; the object may still converge.
    TimedOut {
        last: Option<Observation>,
        elapsed: Duration,
    },
    Failed {
        failure: PollFailure,
        last: Option<Observation>,
    },
    Cancelled {
        last: Option<Observation>,
    },
}

/// Exponential backoff: doubles each step, capped.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(config: &PollConfig) -> Self {
        let max = config.max_interval.max(Duration::from_millis(1));
        Self {
            next: config.initial_interval.max(Duration::from_millis(1)).min(max),
            max,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

/// Read until the object reaches a terminal state, the deadline passes or
/// the caller cancels.
///
/// Transient errors and non-terminal states are retried with backoff.
/// Permanent errors fail immediately. Not-found is interpreted by
/// `not_found`. The read itself is bounded by the deadline, so a hanging
/// client cannot block past it.
pub async fn poll_until_stable<R, Fut, S, F>(
    mut read: R,
    is_terminal_success: S,
    is_terminal_failure: F,
    not_found: NotFoundPolicy,
    config: &PollConfig,
    ctx: &OperationContext,
) -> PollResult
where
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<Observation, ClientError>>,
    S: Fn(&LifecycleState) -> bool,
    F: Fn(&LifecycleState) -> bool,
{
    let started = Instant::now();
    let deadline = ctx.effective_deadline(deadline_after(started, config.timeout));
    let mut backoff = Backoff::new(config);
    let mut last: Option<Observation> = None;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => return PollResult::Cancelled { last },
            r = timeout_at(deadline, read()) => r,
        };

        match outcome {
            Err(_) => {
                warn!(attempt, "Read did not complete before the deadline");
                return PollResult::TimedOut {
                    last,
                    elapsed: started.elapsed(),
                };
            }
            Ok(Ok(observation)) => {
                if is_terminal_success(&observation.lifecycle) {
                    debug!(attempt, id = %observation.id, state = %observation.lifecycle, "Reached terminal state");
                    return PollResult::Success(observation);
                }
                if is_terminal_failure(&observation.lifecycle) {
                    warn!(attempt, id = %observation.id, state = %observation.lifecycle, "Reached failed state");
                    return PollResult::Failed {
                        failure: PollFailure::FailedState(observation.lifecycle.clone()),
                        last: Some(observation),
                    };
                }
                debug!(attempt, id = %observation.id, state = %observation.lifecycle, "Not yet terminal");
                last = Some(observation);
            }
            Ok(Err(e)) if e.is_not_found() => match not_found {
                NotFoundPolicy::Pending => debug!(attempt, "Object not visible yet"),
                NotFoundPolicy::Absent => {
                    debug!(attempt, "Object no longer exists");
                    return PollResult::Absent;
                }
                NotFoundPolicy::Drift => {
                    return PollResult::Failed {
                        failure: PollFailure::Vanished,
                        last,
                    };
                }
            },
            Ok(Err(e)) if e.is_transient() => {
                warn!(attempt, error = %e, "Transient error while polling, retrying");
            }
            Ok(Err(e)) => {
                return PollResult::Failed {
                    failure: PollFailure::Rejected(e),
                    last,
                };
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return PollResult::TimedOut {
                last,
                elapsed: now - started,
            };
        }

        let delay = backoff.next_delay().min(deadline - now);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Waiting before next read");

        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => return PollResult::Cancelled { last },
            _ = sleep(delay) => {}
        }
    }
}
