//! Fleet applier: reconciles a whole manifest and prunes what it no longer
//! declares.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream;
use tracing::{error, info, warn};

use crate::client::RemoteClient;
use crate::error::{EngineError, Result};
use crate::kinds::Catalog;
use crate::poller::OperationContext;
use crate::reconciler::Reconciler;
use crate::schema::ObjectKind;
use crate::state::{DesiredConfiguration, RemoteState};

/// One declared instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Caller-chosen key, stable across applies.
    pub key: String,
    pub kind: Arc<ObjectKind>,
    pub desired: DesiredConfiguration,
}

/// Everything that should exist after an apply.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub revision: u64,
    pub instances: Vec<InstanceSpec>,
}

impl Manifest {
    pub fn new(revision: u64) -> Self {
        Self {
            revision,
            instances: Vec::new(),
        }
    }

    pub fn instance(
        mut self,
        key: &str,
        kind: Arc<ObjectKind>,
        desired: DesiredConfiguration,
    ) -> Self {
        self.instances.push(InstanceSpec {
            key: key.to_string(),
            kind,
            desired,
        });
        self
    }
}

/// An instance the apply could not converge.
#[derive(Debug)]
pub struct InstanceFailure {
    pub key: String,
    pub error: EngineError,
}

/// Outcome of [`Fleet::apply`].
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// State to persist for the next apply, keyed by instance key.
    pub states: BTreeMap<String, RemoteState>,
    pub failures: Vec<InstanceFailure>,
    /// Keys torn down because the manifest no longer declares them.
    pub pruned: Vec<String>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// State to persist for a failed instance: the last observation of an
    /// ambiguous outcome, else the previous state.
    fn keep(&mut self, key: &str, error: &EngineError, prior: Option<&RemoteState>) {
        if let Some(state) = error.last_observed().or(prior) {
            self.states.insert(key.to_string(), state.clone());
        }
    }
}

/// Applies manifests with a shared reconciler.
pub struct Fleet<C: RemoteClient + ?Sized> {
    reconciler: Reconciler<C>,
    catalog: Catalog,
}

impl<C: RemoteClient + ?Sized> Fleet<C> {
    /// `catalog` resolves the kinds of persisted states that are pruned.
    pub fn new(reconciler: Reconciler<C>, catalog: Catalog) -> Self {
        Self {
            reconciler,
            catalog,
        }
    }

    pub fn reconciler(&self) -> &Reconciler<C> {
        &self.reconciler
    }

    /// Reconcile every instance of `manifest` against `prior`, then tear
    /// down instances present in `prior` but missing from `manifest`.
    ///
    /// Instances are independent: one failing does not stop the others.
    pub async fn apply(
        &self,
        manifest: &Manifest,
        prior: BTreeMap<String, RemoteState>,
        ctx: &OperationContext,
    ) -> ApplyReport {
        let parallel = self.reconciler.config().max_parallel.max(1);
        info!(
            revision = manifest.revision,
            instances = manifest.instances.len(),
            known = prior.len(),
            "Applying manifest"
        );

        let mut report = ApplyReport::default();
        let mut declared = BTreeSet::new();
        let mut unique = Vec::with_capacity(manifest.instances.len());
        for spec in &manifest.instances {
            if declared.insert(spec.key.as_str()) {
                unique.push(spec);
            } else {
                report.failures.push(InstanceFailure {
                    key: spec.key.clone(),
                    error: EngineError::Precondition(format!(
                        "instance key '{}' is declared more than once",
                        spec.key
                    )),
                });
            }
        }

        // 1. Converge declared instances
        let prior_ref = &prior;
        let outcomes: Vec<(&InstanceSpec, Result<RemoteState>)> = stream::iter(unique)
            .map(|spec| async move {
                let current = prior_ref.get(&spec.key);
                let result = self
                    .reconciler
                    .reconcile(&spec.kind, &spec.desired, current, ctx)
                    .await;
                (spec, result)
            })
            .buffer_unordered(parallel)
            .collect()
            .await;

        for (spec, result) in outcomes {
            match result {
                Ok(state) => {
                    report.states.insert(spec.key.clone(), state);
                }
                Err(e) => {
                    error!(key = %spec.key, kind = spec.kind.name(), "Reconciliation failed: {}", e);
                    report.keep(&spec.key, &e, prior.get(&spec.key));
                    report.failures.push(InstanceFailure {
                        key: spec.key.clone(),
                        error: e,
                    });
                }
            }
        }

        // 2. Prune instances not in manifest
        let stale: Vec<(&String, &RemoteState)> = prior
            .iter()
            .filter(|(key, _)| !declared.contains(key.as_str()))
            .collect();

        let pruned: Vec<(&String, &RemoteState, Result<()>)> = stream::iter(stale)
            .map(|(key, state)| async move {
                info!(key = %key, kind = %state.kind, id = %state.id, "Pruning");
                (key, state, self.prune(state, ctx).await)
            })
            .buffer_unordered(parallel)
            .collect()
            .await;

        for (key, state, result) in pruned {
            match result {
                Ok(()) => report.pruned.push(key.clone()),
                Err(EngineError::Drift { detail, .. }) => {
                    warn!(key = %key, id = %state.id, "Pruned object was already gone: {}", detail);
                    report.pruned.push(key.clone());
                }
                Err(e) => {
                    error!(key = %key, id = %state.id, "Failed to prune: {}", e);
                    report.keep(key, &e, Some(state));
                    report.failures.push(InstanceFailure {
                        key: key.clone(),
                        error: e,
                    });
                }
            }
        }
        report.pruned.sort();

        info!(
            revision = manifest.revision,
            converged = report.states.len(),
            failed = report.failures.len(),
            pruned = report.pruned.len(),
            "Manifest applied"
        );
        report
    }

    async fn prune(&self, state: &RemoteState, ctx: &OperationContext) -> Result<()> {
        let kind = self.catalog.get(&state.kind).ok_or_else(|| {
            EngineError::Precondition(format!("unknown kind '{}' in persisted state", state.kind))
        })?;
        self.reconciler.teardown(&kind, state, ctx).await
    }
}
