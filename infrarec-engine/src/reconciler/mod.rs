//! Lifecycle reconciler.
//!
//! Converges one remote object to a desired configuration: create and wait
//! for the target state, update in place or replace when the configuration
//! changes, delete and wait for absence. Every step goes through the
//! explicit [`Phase`] machine and every change is reported to the
//! [`AuditSink`].

pub mod phase;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink, TracingAudit};
use crate::client::{Observation, RemoteClient, Scope};
use crate::config::EngineConfig;
use crate::error::{ClientError, EngineError, ErrorContext, Operation, Result, ValidationError};
use crate::plan::{Action, ReconciliationPlan, plan};
use crate::poller::{NotFoundPolicy, OperationContext, PollFailure, PollResult, poll_until_stable};
use crate::query::{self, Filter, RecordStream};
use crate::schema::{LifecycleState, ObjectKind, StateClass};
use crate::state::{DesiredConfiguration, RemoteState};

pub use phase::Phase;
use phase::Machine;

/// Drives remote objects of any kind through their lifecycle.
///
/// Cheap to clone; clones share the client and the audit sink.
pub struct Reconciler<C: RemoteClient + ?Sized> {
    client: Arc<C>,
    config: EngineConfig,
    audit: Arc<dyn AuditSink>,
}

impl<C: RemoteClient + ?Sized> Clone for Reconciler<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            config: self.config.clone(),
            audit: Arc::clone(&self.audit),
        }
    }
}

impl<C: RemoteClient + ?Sized> Reconciler<C> {
    pub fn new(client: Arc<C>, config: EngineConfig) -> Self {
        Self {
            client,
            config,
            audit: Arc::new(TracingAudit),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Converge the object described by `current` to `desired`.
    ///
    /// With no `current` state the object is created. Otherwise it is
    /// refreshed (unless disabled), pending objects are waited on, and the
    /// plan decides between nothing, an in-place update and a replace.
    /// Returns the freshly read state.
    pub async fn reconcile(
        &self,
        kind: &ObjectKind,
        desired: &DesiredConfiguration,
        current: Option<&RemoteState>,
        ctx: &OperationContext,
    ) -> Result<RemoteState> {
        kind.validate(desired)
            .map_err(|e| EngineError::validation(kind.name(), e))?;

        let Some(current) = current else {
            return self.create(kind, desired, ctx).await;
        };
        check_state(kind, current)?;

        info!(kind = kind.name(), id = %current.id, state = %current.lifecycle, "Reconciling");

        let observed = match kind.classify(&current.lifecycle) {
            StateClass::Absent => return self.create(kind, desired, ctx).await,
            // A previous call gave up while the object was converging.
            StateClass::Pending => {
                self.resume(kind, current, NotFoundPolicy::Drift, ctx)
                    .await?
            }
            // Created, but never seen: it may not be visible yet.
            StateClass::Unknown => {
                self.resume(kind, current, NotFoundPolicy::Pending, ctx)
                    .await?
            }
            StateClass::Target if self.config.skip_refresh => current.clone(),
            StateClass::Target | StateClass::Failed | StateClass::Deleting => {
                self.refresh(kind, current, ctx).await?
            }
        };

        let observed = match kind.classify(&observed.lifecycle) {
            StateClass::Pending | StateClass::Unknown => {
                self.resume(kind, &observed, NotFoundPolicy::Drift, ctx)
                    .await?
            }
            _ => observed,
        };

        match kind.classify(&observed.lifecycle) {
            StateClass::Deleting => {
                info!(kind = kind.name(), id = %observed.id, "Object is being deleted, recreating");
                self.confirm_deleted(kind, &observed, ctx).await?;
                self.create(kind, desired, ctx).await
            }
            StateClass::Failed => {
                warn!(kind = kind.name(), id = %observed.id, state = %observed.lifecycle, "Object is in a failed state, replacing");
                self.replace(kind, desired, &observed, ctx).await
            }
            _ => {
                let plan = plan(kind, desired, &observed);
                self.apply(kind, desired, &observed, &plan, ctx).await
            }
        }
    }

    /// Delete the object and wait until it is gone.
    pub async fn teardown(
        &self,
        kind: &ObjectKind,
        current: &RemoteState,
        ctx: &OperationContext,
    ) -> Result<()> {
        if kind.is_discovery_only() {
            return Err(EngineError::validation(
                kind.name(),
                ValidationError::DiscoveryOnly(kind.name().to_string()),
            ));
        }
        check_state(kind, current)?;

        let observed = self.refresh(kind, current, ctx).await?;
        self.confirm_deleted(kind, &observed, ctx).await
    }

    /// Read an existing object into engine state.
    pub async fn import(
        &self,
        kind: &ObjectKind,
        id: &str,
        ctx: &OperationContext,
    ) -> Result<RemoteState> {
        if kind.is_discovery_only() {
            return Err(EngineError::validation(
                kind.name(),
                ValidationError::DiscoveryOnly(kind.name().to_string()),
            ));
        }
        if id.trim().is_empty() {
            return Err(EngineError::Precondition(format!(
                "an identifier is required to import {}",
                kind.name()
            )));
        }

        let state = self.read_state(kind, id, None, ctx).await?;
        info!(kind = kind.name(), id, state = %state.lifecycle, "Imported");
        Ok(state)
    }

    /// Re-read `current`. An object that is gone, or terminated, is drift.
    pub async fn refresh(
        &self,
        kind: &ObjectKind,
        current: &RemoteState,
        ctx: &OperationContext,
    ) -> Result<RemoteState> {
        check_state(kind, current)?;

        let state = self.read_state(kind, &current.id, Some(current), ctx).await?;
        if kind.is_absent(&state.lifecycle) {
            let err = EngineError::Drift {
                context: ErrorContext::new(kind.name(), Operation::Read)
                    .with_id(&current.id)
                    .with_state(Some(state.lifecycle.clone())),
                detail: format!("object is already {}", state.lifecycle),
            };
            let mut machine = Machine::new(kind.name(), Phase::Stable).with_id(&current.id);
            return Err(self.abort(&mut machine, err));
        }
        Ok(state)
    }

    /// List objects of `kind` in `scope` that pass `filters`.
    pub fn discover<'a>(
        &'a self,
        kind: &'a ObjectKind,
        scope: &'a Scope,
        filters: &'a [Filter],
        ctx: &'a OperationContext,
    ) -> Result<RecordStream<'a>> {
        query::discover(&*self.client, kind, scope, filters, &self.config, ctx)
    }

    async fn apply(
        &self,
        kind: &ObjectKind,
        desired: &DesiredConfiguration,
        current: &RemoteState,
        plan: &ReconciliationPlan,
        ctx: &OperationContext,
    ) -> Result<RemoteState> {
        debug!(kind = kind.name(), id = %current.id, action = %plan.action, changed = ?plan.changed, "Planned");
        match plan.action {
            Action::NoOp => Ok(current.clone()),
            Action::UpdateInPlace => self.update(kind, current, plan, ctx).await,
            Action::Replace => {
                info!(
                    kind = kind.name(),
                    id = %current.id,
                    attributes = ?plan.immutable_changed,
                    "Immutable attributes changed, replacing"
                );
                self.replace(kind, desired, current, ctx).await
            }
        }
    }

    async fn create(
        &self,
        kind: &ObjectKind,
        desired: &DesiredConfiguration,
        ctx: &OperationContext,
    ) -> Result<RemoteState> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled {
                context: ErrorContext::new(kind.name(), Operation::Create),
                last_observed: None,
            });
        }

        let mut machine = Machine::new(kind.name(), Phase::Absent);
        machine.advance(Phase::Creating);
        info!(kind = kind.name(), "Creating");

        // Mutating calls are never interrupted: an abandoned create leaks
        // an object nobody holds an identifier for.
        let payload = kind.create_payload(desired);
        let id = match self.client.create(kind, &payload).await {
            Ok(id) => id,
            Err(e) => {
                let err = mutation_error(ErrorContext::new(kind.name(), Operation::Create), e);
                return Err(self.abort(&mut machine, err));
            }
        };
        machine.set_id(&id);
        machine.advance(Phase::Polling);

        self.await_state(
            kind,
            &id,
            Operation::Create,
            NotFoundPolicy::Pending,
            None,
            ctx,
        )
        .await
        .map_err(|e| self.abort(&mut machine, e))?;
        machine.advance(Phase::Stable);

        let state = self
            .read_state(kind, &id, None, ctx)
            .await
            .map_err(|e| self.abort(&mut machine, e))?;

        info!(kind = kind.name(), id = %state.id, state = %state.lifecycle, "Created");
        self.audit.record(AuditEvent::Created {
            kind: kind.name().to_string(),
            id: state.id.clone(),
        });
        Ok(state)
    }

    async fn update(
        &self,
        kind: &ObjectKind,
        current: &RemoteState,
        plan: &ReconciliationPlan,
        ctx: &OperationContext,
    ) -> Result<RemoteState> {
        let mut machine = Machine::new(kind.name(), Phase::Stable).with_id(&current.id);
        machine.advance(Phase::Updating);
        info!(kind = kind.name(), id = %current.id, attributes = ?plan.changed, "Updating");

        if let Err(e) = self.client.update(kind, &current.id, &plan.patch).await {
            let context = ErrorContext::new(kind.name(), Operation::Update)
                .with_id(&current.id)
                .with_state(Some(current.lifecycle.clone()));
            return Err(self.abort(&mut machine, mutation_error(context, e)));
        }
        machine.advance(Phase::Polling);

        self.await_state(
            kind,
            &current.id,
            Operation::Update,
            NotFoundPolicy::Drift,
            Some(current),
            ctx,
        )
        .await
        .map_err(|e| self.abort(&mut machine, e))?;
        machine.advance(Phase::Stable);

        let state = self
            .read_state(kind, &current.id, Some(current), ctx)
            .await
            .map_err(|e| self.abort(&mut machine, e))?;

        self.audit.record(AuditEvent::Updated {
            kind: kind.name().to_string(),
            id: state.id.clone(),
            attributes: plan.changed.clone(),
        });
        Ok(state)
    }

    async fn replace(
        &self,
        kind: &ObjectKind,
        desired: &DesiredConfiguration,
        current: &RemoteState,
        ctx: &OperationContext,
    ) -> Result<RemoteState> {
        self.teardown(kind, current, ctx).await?;
        let state = match self.create(kind, desired, ctx).await {
            Ok(state) => state,
            // A create that got as far as an identifier already carries it.
            Err(e) if e.last_observed().is_some() => return Err(e),
            Err(e) => {
                warn!(kind = kind.name(), old_id = %current.id, "Replacement failed after delete");
                return Err(EngineError::ReplaceIncomplete {
                    old_id: current.id.clone(),
                    source: Box::new(e),
                    last_observed: Box::new(RemoteState::gone(kind, &current.id)),
                });
            }
        };

        self.audit.record(AuditEvent::Replaced {
            kind: kind.name().to_string(),
            old_id: current.id.clone(),
            new_id: state.id.clone(),
        });
        Ok(state)
    }

    /// Delete unless a delete is already running, then wait for absence.
    async fn confirm_deleted(
        &self,
        kind: &ObjectKind,
        observed: &RemoteState,
        ctx: &OperationContext,
    ) -> Result<()> {
        let mut machine = Machine::new(kind.name(), Phase::Stable).with_id(&observed.id);
        machine.advance(Phase::Deleting);

        if kind.classify(&observed.lifecycle) == StateClass::Deleting {
            debug!(kind = kind.name(), id = %observed.id, "Delete already in progress");
        } else {
            info!(kind = kind.name(), id = %observed.id, "Deleting");
            match self.client.delete(kind, &observed.id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(kind = kind.name(), id = %observed.id, "Already gone");
                }
                Err(e) => {
                    let context = ErrorContext::new(kind.name(), Operation::Delete)
                        .with_id(&observed.id)
                        .with_state(Some(observed.lifecycle.clone()));
                    return Err(self.abort(&mut machine, mutation_error(context, e)));
                }
            }
        }
        machine.advance(Phase::PollingAbsence);

        // An object that was already failed may still report so right after
        // the delete call.
        let was_failed = kind.is_failed(&observed.lifecycle);
        let poll = self.config.poll_config_for(kind);
        let client = &*self.client;
        let id = observed.id.as_str();
        let result = poll_until_stable(
            move || client.read(kind, id),
            |s| kind.is_absent(s),
            |s| !was_failed && kind.is_failed(s),
            NotFoundPolicy::Absent,
            &poll,
            ctx,
        )
        .await;

        match result {
            PollResult::Absent | PollResult::Success(_) => {}
            other => {
                let err = poll_error(kind, id, Operation::Delete, other, Some(observed));
                return Err(self.abort(&mut machine, err));
            }
        }
        machine.advance(Phase::Absent);

        info!(kind = kind.name(), id, "Deleted");
        self.audit.record(AuditEvent::Deleted {
            kind: kind.name().to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn resume(
        &self,
        kind: &ObjectKind,
        current: &RemoteState,
        not_found: NotFoundPolicy,
        ctx: &OperationContext,
    ) -> Result<RemoteState> {
        info!(kind = kind.name(), id = %current.id, state = %current.lifecycle, "Resuming poll");
        let mut machine = Machine::new(kind.name(), Phase::Creating).with_id(&current.id);
        machine.advance(Phase::Polling);

        let observation = self
            .await_state(kind, &current.id, Operation::Poll, not_found, Some(current), ctx)
            .await
            .map_err(|e| self.abort(&mut machine, e))?;
        machine.advance(Phase::Stable);

        Ok(RemoteState::from_observation(kind, observation))
    }

    /// Poll until the kind's target state.
    async fn await_state(
        &self,
        kind: &ObjectKind,
        id: &str,
        operation: Operation,
        not_found: NotFoundPolicy,
        fallback: Option<&RemoteState>,
        ctx: &OperationContext,
    ) -> Result<Observation> {
        let poll = self.config.poll_config_for(kind);
        let client = &*self.client;
        let result = poll_until_stable(
            move || client.read(kind, id),
            |s| kind.is_target(s),
            |s| kind.is_failed(s),
            not_found,
            &poll,
            ctx,
        )
        .await;

        match result {
            PollResult::Success(observation) => Ok(observation),
            other => Err(poll_error(kind, id, operation, other, fallback)),
        }
    }

    /// One successful read, retrying transient errors. Not-found is drift.
    async fn read_state(
        &self,
        kind: &ObjectKind,
        id: &str,
        fallback: Option<&RemoteState>,
        ctx: &OperationContext,
    ) -> Result<RemoteState> {
        let poll = self.config.poll_config_for(kind);
        let client = &*self.client;
        let result = poll_until_stable(
            move || client.read(kind, id),
            |_| true,
            |_| false,
            NotFoundPolicy::Drift,
            &poll,
            ctx,
        )
        .await;

        match result {
            PollResult::Success(observation) => Ok(RemoteState::from_observation(kind, observation)),
            other => {
                let err = poll_error(kind, id, Operation::Read, other, fallback);
                let mut machine = Machine::new(kind.name(), Phase::Stable).with_id(id);
                Err(self.abort(&mut machine, err))
            }
        }
    }

    /// Abort the machine and report the failure.
    fn abort(&self, machine: &mut Machine<'_>, err: EngineError) -> EngineError {
        machine.fail(&err);

        if let Some(context) = err.context() {
            let event = match (&err, &context.id) {
                (EngineError::Drift { detail, .. }, Some(id)) => AuditEvent::Drift {
                    kind: context.kind.clone(),
                    id: id.clone(),
                    detail: detail.clone(),
                },
                _ => AuditEvent::Failed {
                    kind: context.kind.clone(),
                    id: context.id.clone(),
                    operation: context.operation,
                    reason: err.to_string(),
                },
            };
            self.audit.record(event);
        }
        err
    }
}

/// Persisted state must belong to `kind` and carry an identifier.
fn check_state(kind: &ObjectKind, state: &RemoteState) -> Result<()> {
    if state.kind != kind.name() {
        return Err(EngineError::Precondition(format!(
            "state of kind {} cannot be reconciled as {}",
            state.kind,
            kind.name()
        )));
    }
    if state.id.trim().is_empty() {
        return Err(EngineError::Precondition(format!(
            "{} state has no identifier",
            kind.name()
        )));
    }
    Ok(())
}

/// Map a failed mutating call. Not-found on create is a rejection, not drift.
fn mutation_error(context: ErrorContext, source: ClientError) -> EngineError {
    if context.operation == Operation::Create && source.is_not_found() {
        return EngineError::PermanentRemote { context, source };
    }
    EngineError::from_client(context, source)
}

/// Map a non-successful poll outcome.
///
/// Ambiguous outcomes carry the last observed state, falling back to
/// `fallback` and then to an unobserved state with the identifier, so the
/// caller can always persist something to resume from.
fn poll_error(
    kind: &ObjectKind,
    id: &str,
    operation: Operation,
    result: PollResult,
    fallback: Option<&RemoteState>,
) -> EngineError {
    let context = |last: Option<&LifecycleState>| {
        ErrorContext::new(kind.name(), operation)
            .with_id(id)
            .with_state(last.cloned())
    };
    let resumable = |last: Option<Observation>| -> Box<RemoteState> {
        Box::new(match (last, fallback) {
            (Some(observation), _) => RemoteState::from_observation(kind, observation),
            (None, Some(state)) => state.clone(),
            (None, None) => RemoteState::unobserved(kind, id),
        })
    };

    match result {
        PollResult::TimedOut { last, elapsed } => EngineError::PollTimeout {
            context: context(last.as_ref().map(|o| &o.lifecycle)),
            elapsed,
            last_observed: Some(resumable(last)),
        },
        PollResult::Cancelled { last } => EngineError::Cancelled {
            context: context(last.as_ref().map(|o| &o.lifecycle)),
            last_observed: Some(resumable(last)),
        },
        PollResult::Failed { failure, last } => {
            let last_state = last.as_ref().map(|o| &o.lifecycle);
            match failure {
                PollFailure::FailedState(state) => EngineError::PermanentRemote {
                    context: context(Some(&state)),
                    source: ClientError::server(format!("{} entered failed state {}", id, state)),
                },
                PollFailure::Vanished => EngineError::Drift {
                    context: context(last_state),
                    detail: "object no longer exists".to_string(),
                },
                PollFailure::Rejected(source) => {
                    EngineError::from_client(context(last_state), source)
                }
            }
        }
        PollResult::Absent => EngineError::Drift {
            context: context(None),
            detail: "object no longer exists".to_string(),
        },
        PollResult::Success(observation) => EngineError::PermanentRemote {
            context: context(Some(&observation.lifecycle)),
            source: ClientError::server(format!(
                "{} reported {} while it was expected to be gone",
                id, observation.lifecycle
            )),
        },
    }
}
