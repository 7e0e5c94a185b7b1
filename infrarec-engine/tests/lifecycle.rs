//! End-to-end lifecycle of a remote peering connection against the
//! in-memory control plane.

use std::sync::Arc;

use infrarec_engine::test_util::{CallKind, MemoryCloud, RecordingAudit};
use std::time::Duration;

use infrarec_engine::{
    Action, AuditEvent, ClientError, DesiredConfiguration, DesiredValue, EngineConfig,
    EngineError, Operation, OperationContext, Reconciler, StateClass, Value, kinds, plan,
};

fn cloud() -> Arc<MemoryCloud> {
    Arc::new(
        MemoryCloud::new()
            .with_transition_reads(2)
            .with_computed(kinds::remote_peering_connection::KIND, "peering_status", "NEW")
            .with_computed(kinds::remote_peering_connection::KIND, "time_created", "2026-01-01T00:00:00Z"),
    )
}

fn desired(compartment: &str, name: &str) -> DesiredConfiguration {
    DesiredConfiguration::new()
        .set("compartment_id", compartment)
        .set("drg_id", "ocid1.drg.1")
        .set("display_name", name)
}

// =============================================================================
// Create / Update / Replace
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_create_update_replace() {
    let cloud = cloud();
    let audit = Arc::new(RecordingAudit::new());
    let reconciler =
        Reconciler::new(Arc::clone(&cloud), EngineConfig::default()).with_audit(audit.clone());
    let kind = kinds::remote_peering_connection();
    let ctx = OperationContext::new();

    // Create
    let created = reconciler
        .reconcile(&kind, &desired("A", "x"), None, &ctx)
        .await
        .unwrap();
    assert_eq!(created.lifecycle.as_str(), "AVAILABLE");
    assert_eq!(created.get("peering_status"), Some(&Value::string("NEW")));
    assert_eq!(created.get("state"), Some(&Value::string("AVAILABLE")));

    // Same configuration: no mutating calls
    cloud.clear_calls();
    let same = reconciler
        .reconcile(&kind, &desired("A", "x"), Some(&created), &ctx)
        .await
        .unwrap();
    assert_eq!(same.id, created.id);
    assert_eq!(cloud.mutating_calls(), 0);

    // Mutable change: one update with one field, same id
    cloud.clear_calls();
    let updated = reconciler
        .reconcile(&kind, &desired("A", "y"), Some(&same), &ctx)
        .await
        .unwrap();
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.get("display_name"), Some(&Value::string("y")));
    let updates = cloud.calls_of(CallKind::Update);
    assert_eq!(updates.len(), 1);
    let patch = updates[0].patch.clone().unwrap();
    assert_eq!(patch.len(), 1);
    assert_eq!(
        patch.get("display_name"),
        Some(&DesiredValue::Set(Value::string("y")))
    );
    assert!(cloud.calls_of(CallKind::Create).is_empty());
    assert!(cloud.calls_of(CallKind::Delete).is_empty());

    // Immutable change: replace with a new id
    cloud.clear_calls();
    let replaced = reconciler
        .reconcile(&kind, &desired("B", "y"), Some(&updated), &ctx)
        .await
        .unwrap();
    assert_ne!(replaced.id, created.id);
    assert_eq!(replaced.get("compartment_id"), Some(&Value::string("B")));
    assert!(!cloud.exists(&created.id));
    assert_eq!(cloud.count(kind.name()), 1);

    let calls: Vec<CallKind> = cloud
        .calls()
        .into_iter()
        .map(|c| c.op)
        .filter(|op| op.is_mutating())
        .collect();
    assert_eq!(calls, vec![CallKind::Delete, CallKind::Create]);

    let events = audit.events();
    assert!(events.contains(&AuditEvent::Updated {
        kind: kind.name().to_string(),
        id: created.id.clone(),
        attributes: vec!["display_name".to_string()],
    }));
    assert!(events.contains(&AuditEvent::Replaced {
        kind: kind.name().to_string(),
        old_id: created.id.clone(),
        new_id: replaced.id.clone(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_replace_resumes_after_failed_create() {
    let cloud = cloud();
    let reconciler = Reconciler::new(Arc::clone(&cloud), EngineConfig::default());
    let kind = kinds::remote_peering_connection();
    let ctx = OperationContext::new();

    let original = reconciler
        .reconcile(&kind, &desired("A", "x"), None, &ctx)
        .await
        .unwrap();

    // The delete goes through, the create of the successor does not
    cloud.fail_next(CallKind::Create, ClientError::transient("throttled"));
    let err = reconciler
        .reconcile(&kind, &desired("B", "x"), Some(&original), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ReplaceIncomplete { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.context().unwrap().operation, Operation::Create);
    assert!(!cloud.exists(&original.id));

    let gone = err.last_observed().cloned().unwrap();
    assert_eq!(gone.id, original.id);
    assert_eq!(kind.classify(&gone.lifecycle), StateClass::Absent);

    // Re-invoking with the persisted state creates, without touching the old id
    cloud.clear_calls();
    let replaced = reconciler
        .reconcile(&kind, &desired("B", "x"), Some(&gone), &ctx)
        .await
        .unwrap();
    assert_ne!(replaced.id, original.id);
    assert_eq!(replaced.get("compartment_id"), Some(&Value::string("B")));
    assert!(cloud.calls_of(CallKind::Delete).is_empty());
    assert_eq!(cloud.count(kind.name()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_poll_timeout_is_accepted() {
    let cloud = cloud();
    let config = EngineConfig {
        poll_timeout_secs: Some(u64::MAX),
        ..EngineConfig::default()
    };
    let reconciler = Reconciler::new(Arc::clone(&cloud), config);
    let kind = kinds::remote_peering_connection();

    let state = reconciler
        .reconcile(&kind, &desired("A", "x"), None, &OperationContext::new())
        .await
        .unwrap();
    assert_eq!(state.lifecycle.as_str(), "AVAILABLE");
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_twice_is_noop() {
    let cloud = cloud();
    let reconciler = Reconciler::new(Arc::clone(&cloud), EngineConfig::default());
    let kind = kinds::remote_peering_connection();
    let ctx = OperationContext::new();
    let desired = desired("A", "x");

    let state = reconciler.reconcile(&kind, &desired, None, &ctx).await.unwrap();
    assert_eq!(plan(&kind, &desired, &state).action, Action::NoOp);

    cloud.clear_calls();
    let again = reconciler
        .reconcile(&kind, &desired, Some(&state), &ctx)
        .await
        .unwrap();
    assert_eq!(again.id, state.id);
    assert_eq!(again.attributes, state.attributes);
    assert_eq!(cloud.mutating_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_skip_refresh_makes_no_calls_on_noop() {
    let cloud = cloud();
    let config = EngineConfig {
        skip_refresh: true,
        ..EngineConfig::default()
    };
    let reconciler = Reconciler::new(Arc::clone(&cloud), config);
    let kind = kinds::remote_peering_connection();
    let ctx = OperationContext::new();

    let state = reconciler
        .reconcile(&kind, &desired("A", "x"), None, &ctx)
        .await
        .unwrap();
    cloud.clear_calls();
    reconciler
        .reconcile(&kind, &desired("A", "x"), Some(&state), &ctx)
        .await
        .unwrap();
    assert!(cloud.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_clear_unsets_attribute() {
    let cloud = cloud();
    let reconciler = Reconciler::new(Arc::clone(&cloud), EngineConfig::default());
    let kind = kinds::remote_peering_connection();
    let ctx = OperationContext::new();

    let state = reconciler
        .reconcile(&kind, &desired("A", "x"), None, &ctx)
        .await
        .unwrap();

    let cleared = DesiredConfiguration::new()
        .set("compartment_id", "A")
        .set("drg_id", "ocid1.drg.1")
        .clear("display_name");
    let state = reconciler
        .reconcile(&kind, &cleared, Some(&state), &ctx)
        .await
        .unwrap();
    assert!(state.get("display_name").is_none());
    assert_eq!(cloud.calls_of(CallKind::Update).len(), 1);

    // Already unset: nothing to do
    cloud.clear_calls();
    reconciler
        .reconcile(&kind, &cleared, Some(&state), &ctx)
        .await
        .unwrap();
    assert_eq!(cloud.mutating_calls(), 0);
}

// =============================================================================
// Teardown and drift
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_teardown_twice_is_drift() {
    let cloud = cloud();
    let reconciler = Reconciler::new(Arc::clone(&cloud), EngineConfig::default());
    let kind = kinds::remote_peering_connection();
    let ctx = OperationContext::new();

    let state = reconciler
        .reconcile(&kind, &desired("A", "x"), None, &ctx)
        .await
        .unwrap();
    reconciler.teardown(&kind, &state, &ctx).await.unwrap();
    assert_eq!(cloud.count(kind.name()), 0);

    // Deleting again: the object is gone before the delete call
    let err = reconciler.teardown(&kind, &state, &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::Drift { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_teardown_stuck_terminating_times_out() {
    let cloud = Arc::new(
        MemoryCloud::new()
            .with_transition_reads(usize::MAX)
            .keep_terminated(),
    );
    let reconciler = Reconciler::new(Arc::clone(&cloud), EngineConfig::default());
    let kind = kinds::remote_peering_connection();

    let mut attributes = infrarec_engine::schema::Attributes::new();
    attributes.insert("compartment_id".to_string(), Value::string("A"));
    attributes.insert("drg_id".to_string(), Value::string("ocid1.drg.1"));
    let id = cloud.insert(kind.name(), "AVAILABLE", attributes);
    let state = reconciler
        .import(&kind, &id, &OperationContext::new())
        .await
        .unwrap();

    let ctx = OperationContext::new().with_timeout(Duration::from_secs(60));
    let err = reconciler.teardown(&kind, &state, &ctx).await.unwrap_err();

    let EngineError::PollTimeout { context, .. } = &err else {
        panic!("expected timeout, got {err}");
    };
    assert_eq!(context.operation, Operation::Delete);
    assert_eq!(context.id.as_deref(), Some(id.as_str()));
    assert!(err.is_retryable());

    let last = err.last_observed().unwrap();
    assert_eq!(last.id, id);
    assert_eq!(last.lifecycle.as_str(), "TERMINATING");
    assert_eq!(cloud.calls_of(CallKind::Delete).len(), 1);

    // Resuming from the persisted state waits again without a second delete
    let ctx = OperationContext::new().with_timeout(Duration::from_secs(60));
    let err = reconciler.teardown(&kind, last, &ctx).await.unwrap_err();
    assert!(matches!(err, EngineError::PollTimeout { .. }));
    assert_eq!(cloud.calls_of(CallKind::Delete).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_vanished_object_is_drift() {
    let cloud = cloud();
    let reconciler = Reconciler::new(Arc::clone(&cloud), EngineConfig::default());
    let kind = kinds::remote_peering_connection();
    let ctx = OperationContext::new();

    let state = reconciler
        .reconcile(&kind, &desired("A", "x"), None, &ctx)
        .await
        .unwrap();
    cloud.remove(&state.id);

    let err = reconciler
        .reconcile(&kind, &desired("A", "y"), Some(&state), &ctx)
        .await
        .unwrap_err();
    let EngineError::Drift { context, .. } = &err else {
        panic!("expected drift, got {err}");
    };
    assert_eq!(context.id.as_deref(), Some(state.id.as_str()));
    assert!(cloud.calls_of(CallKind::Update).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_update_rejection_surfaces_context() {
    let cloud = cloud();
    let reconciler = Reconciler::new(Arc::clone(&cloud), EngineConfig::default());
    let kind = kinds::remote_peering_connection();
    let ctx = OperationContext::new();

    let state = reconciler
        .reconcile(&kind, &desired("A", "x"), None, &ctx)
        .await
        .unwrap();
    cloud.fail_next(
        CallKind::Update,
        infrarec_engine::ClientError::rejected("display name taken"),
    );

    let err = reconciler
        .reconcile(&kind, &desired("A", "y"), Some(&state), &ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PermanentRemote { .. }));
    let context = err.context().unwrap();
    assert_eq!(context.operation, infrarec_engine::Operation::Update);
    assert_eq!(context.id.as_deref(), Some(state.id.as_str()));
    assert!(err.to_string().contains("display name taken"));
}
