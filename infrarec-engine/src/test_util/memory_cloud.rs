//! In-memory control plane implementing [`RemoteClient`].
//!
//! Objects move through a scripted lifecycle: a create (or update) leaves
//! the object pending for a configurable number of reads before it settles
//! on its target state; a delete leaves it terminating for the same number
//! of reads before it disappears.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::client::{Observation, Page, RemoteClient, Scope};
use crate::error::ClientError;
use crate::schema::{Attributes, LifecycleState, ObjectKind, Value};
use crate::state::{DesiredValue, Patch};

/// Undeclared attribute every read carries; canonicalization must drop it.
pub const ETAG: &str = "etag";

/// Remote operation recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Create,
    Read,
    Update,
    Delete,
    List,
}

impl CallKind {
    pub fn is_mutating(self) -> bool {
        matches!(self, CallKind::Create | CallKind::Update | CallKind::Delete)
    }
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: CallKind,
    pub kind: String,
    pub id: Option<String>,
    pub patch: Option<Patch>,
    pub page_token: Option<String>,
}

/// Lifecycle names used for one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifecycle {
    pub pending: String,
    pub target: String,
    pub deleting: String,
    pub terminated: String,
    pub failed: String,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            pending: "PROVISIONING".to_string(),
            target: "AVAILABLE".to_string(),
            deleting: "TERMINATING".to_string(),
            terminated: "TERMINATED".to_string(),
            failed: "FAILED".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    kind: String,
    lifecycle: String,
    attributes: Attributes,
    /// Reads left before the object leaves its transitional state.
    countdown: usize,
    settle: Settle,
    version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settle {
    Stable,
    ToTarget,
    ToTerminated,
    ToFailed,
}

/// How `list` hands out page tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Paging {
    Offsets,
    /// The same token forever.
    Stuck,
    /// "1", "2", "1", ...
    Cyclic,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    order: Vec<String>,
    calls: Vec<Call>,
    faults: VecDeque<(CallKind, ClientError)>,
}

/// Thread-safe fake of a cloud control plane.
#[derive(Debug)]
pub struct MemoryCloud {
    inner: Mutex<Inner>,
    transition_reads: usize,
    page_size: usize,
    keep_terminated: bool,
    lifecycles: HashMap<String, Lifecycle>,
    computed: HashMap<String, Attributes>,
    paging: Paging,
    failing_deletes: bool,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            transition_reads: 1,
            page_size: 50,
            keep_terminated: false,
            lifecycles: HashMap::new(),
            computed: HashMap::new(),
            paging: Paging::Offsets,
            failing_deletes: false,
        }
    }

    /// Number of reads an object stays pending (or terminating).
    /// `usize::MAX` keeps it there forever.
    pub fn with_transition_reads(mut self, reads: usize) -> Self {
        self.transition_reads = reads;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Report deleted objects as terminated instead of not-found.
    pub fn keep_terminated(mut self) -> Self {
        self.keep_terminated = true;
        self
    }

    pub fn with_lifecycle(mut self, kind: &str, lifecycle: Lifecycle) -> Self {
        self.lifecycles.insert(kind.to_string(), lifecycle);
        self
    }

    /// Attribute the control plane fills in on create for `kind`.
    pub fn with_computed(mut self, kind: &str, name: &str, value: impl Into<Value>) -> Self {
        self.computed
            .entry(kind.to_string())
            .or_default()
            .insert(name.to_string(), value.into());
        self
    }

    /// Hand out the same page token forever.
    pub fn with_stuck_pagination(mut self) -> Self {
        self.paging = Paging::Stuck;
        self
    }

    /// Hand out page tokens that come back around after two pages.
    pub fn with_cyclic_pagination(mut self) -> Self {
        self.paging = Paging::Cyclic;
        self
    }

    /// Deleted objects end in the failed state instead of terminated.
    pub fn with_failing_deletes(mut self) -> Self {
        self.failing_deletes = true;
        self
    }

    /// Make the next call of type `op` fail with `error`.
    pub fn fail_next(&self, op: CallKind, error: ClientError) {
        self.lock().faults.push_back((op, error));
    }

    /// Seed an object directly, bypassing the call log.
    pub fn insert(&self, kind: &str, lifecycle: &str, attributes: Attributes) -> String {
        let id = new_id(kind);
        let mut inner = self.lock();
        inner.objects.insert(
            id.clone(),
            StoredObject {
                kind: kind.to_string(),
                lifecycle: lifecycle.to_string(),
                attributes,
                countdown: 0,
                settle: Settle::Stable,
                version: 1,
            },
        );
        inner.order.push(id.clone());
        id
    }

    /// Delete an object behind the engine's back.
    pub fn remove(&self, id: &str) -> bool {
        let mut inner = self.lock();
        inner.order.retain(|o| o != id);
        inner.objects.remove(id).is_some()
    }

    /// Force an object into `lifecycle` and keep it there.
    pub fn set_lifecycle(&self, id: &str, lifecycle: &str) {
        if let Some(obj) = self.lock().objects.get_mut(id) {
            obj.lifecycle = lifecycle.to_string();
            obj.settle = Settle::Stable;
            obj.countdown = 0;
        }
    }

    /// Overwrite one attribute behind the engine's back.
    pub fn set_attribute(&self, id: &str, name: &str, value: impl Into<Value>) {
        if let Some(obj) = self.lock().objects.get_mut(id) {
            obj.attributes.insert(name.to_string(), value.into());
        }
    }

    pub fn get(&self, id: &str) -> Option<(String, Attributes)> {
        self.lock()
            .objects
            .get(id)
            .map(|o| (o.lifecycle.clone(), o.attributes.clone()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.lock().objects.contains_key(id)
    }

    /// Live objects of `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.lock()
            .objects
            .values()
            .filter(|o| o.kind == kind)
            .count()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, op: CallKind) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn mutating_calls(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op.is_mutating())
            .count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicking test thread must not hide the state from the others.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lifecycle(&self, kind: &str) -> Lifecycle {
        self.lifecycles.get(kind).cloned().unwrap_or_default()
    }

    /// Record the call and pop a matching injected fault, if any.
    fn begin(&self, inner: &mut Inner, call: Call) -> Result<(), ClientError> {
        let op = call.op;
        inner.calls.push(call);
        match inner.faults.iter().position(|(o, _)| *o == op) {
            Some(pos) => match inner.faults.remove(pos) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn observe(&self, id: &str, obj: &StoredObject) -> Observation {
        let mut attributes = obj.attributes.clone();
        attributes.insert("state".to_string(), Value::string(&obj.lifecycle));
        attributes.insert(ETAG.to_string(), Value::string(format!("v{}", obj.version)));
        Observation {
            id: id.to_string(),
            lifecycle: LifecycleState::new(&obj.lifecycle),
            attributes,
        }
    }
}

fn new_id(kind: &str) -> String {
    format!("ocid1.{}.{}", kind, Uuid::new_v4().simple())
}

fn in_scope(obj: &StoredObject, scope: &Scope) -> bool {
    scope
        .iter()
        .all(|(name, value)| obj.attributes.get(name).and_then(Value::as_str) == Some(value))
}

#[async_trait]
impl RemoteClient for MemoryCloud {
    async fn create(&self, kind: &ObjectKind, attributes: &Attributes) -> Result<String, ClientError> {
        let mut inner = self.lock();
        self.begin(
            &mut inner,
            Call {
                op: CallKind::Create,
                kind: kind.name().to_string(),
                id: None,
                patch: None,
                page_token: None,
            },
        )?;

        let lifecycle = self.lifecycle(kind.name());
        let mut stored = attributes.clone();
        if let Some(extra) = self.computed.get(kind.name()) {
            stored.extend(extra.clone());
        }

        let id = new_id(kind.name());
        let (state, settle) = if self.transition_reads == 0 {
            (lifecycle.target, Settle::Stable)
        } else {
            (lifecycle.pending, Settle::ToTarget)
        };
        inner.objects.insert(
            id.clone(),
            StoredObject {
                kind: kind.name().to_string(),
                lifecycle: state,
                attributes: stored,
                countdown: self.transition_reads,
                settle,
                version: 1,
            },
        );
        inner.order.push(id.clone());
        Ok(id)
    }

    async fn read(&self, kind: &ObjectKind, id: &str) -> Result<Observation, ClientError> {
        let mut inner = self.lock();
        self.begin(
            &mut inner,
            Call {
                op: CallKind::Read,
                kind: kind.name().to_string(),
                id: Some(id.to_string()),
                patch: None,
                page_token: None,
            },
        )?;

        let lifecycle = self.lifecycle(kind.name());
        let Some(obj) = inner.objects.get_mut(id).filter(|o| o.kind == kind.name()) else {
            return Err(ClientError::not_found(format!("{} {} not found", kind.name(), id)));
        };

        let observation = self.observe(id, obj);
        if obj.settle != Settle::Stable && obj.countdown != usize::MAX {
            obj.countdown = obj.countdown.saturating_sub(1);
            if obj.countdown == 0 {
                match obj.settle {
                    Settle::ToTarget => obj.lifecycle = lifecycle.target,
                    Settle::ToTerminated => obj.lifecycle = lifecycle.terminated,
                    Settle::ToFailed => obj.lifecycle = lifecycle.failed,
                    Settle::Stable => {}
                }
                obj.settle = Settle::Stable;
            }
        }

        if obj.lifecycle == self.lifecycle(kind.name()).terminated && !self.keep_terminated {
            inner.objects.remove(id);
            inner.order.retain(|o| o != id);
        }

        Ok(observation)
    }

    async fn update(&self, kind: &ObjectKind, id: &str, patch: &Patch) -> Result<(), ClientError> {
        let mut inner = self.lock();
        self.begin(
            &mut inner,
            Call {
                op: CallKind::Update,
                kind: kind.name().to_string(),
                id: Some(id.to_string()),
                patch: Some(patch.clone()),
                page_token: None,
            },
        )?;

        let lifecycle = self.lifecycle(kind.name());
        let Some(obj) = inner.objects.get_mut(id).filter(|o| o.kind == kind.name()) else {
            return Err(ClientError::not_found(format!("{} {} not found", kind.name(), id)));
        };
        if obj.lifecycle != lifecycle.target {
            return Err(ClientError::rejected(format!(
                "{} {} is {}, cannot update",
                kind.name(),
                id,
                obj.lifecycle
            )));
        }

        for (name, value) in patch {
            match value {
                DesiredValue::Set(v) => {
                    obj.attributes.insert(name.clone(), v.clone());
                }
                DesiredValue::Clear => {
                    obj.attributes.remove(name);
                }
            }
        }
        obj.version += 1;
        if self.transition_reads > 0 {
            obj.lifecycle = lifecycle.pending;
            obj.settle = Settle::ToTarget;
            obj.countdown = self.transition_reads;
        }
        Ok(())
    }

    async fn delete(&self, kind: &ObjectKind, id: &str) -> Result<(), ClientError> {
        let mut inner = self.lock();
        self.begin(
            &mut inner,
            Call {
                op: CallKind::Delete,
                kind: kind.name().to_string(),
                id: Some(id.to_string()),
                patch: None,
                page_token: None,
            },
        )?;

        let lifecycle = self.lifecycle(kind.name());
        let Some(obj) = inner.objects.get_mut(id).filter(|o| o.kind == kind.name()) else {
            return Err(ClientError::not_found(format!("{} {} not found", kind.name(), id)));
        };

        if self.failing_deletes {
            obj.lifecycle = lifecycle.deleting;
            obj.settle = Settle::ToFailed;
            obj.countdown = self.transition_reads.max(1);
        } else if self.transition_reads == 0 {
            obj.lifecycle = lifecycle.terminated;
            obj.settle = Settle::Stable;
            if !self.keep_terminated {
                inner.objects.remove(id);
                inner.order.retain(|o| o != id);
            }
        } else {
            obj.lifecycle = lifecycle.deleting;
            obj.settle = Settle::ToTerminated;
            obj.countdown = self.transition_reads;
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: &ObjectKind,
        scope: &Scope,
        page_token: Option<&str>,
    ) -> Result<Page, ClientError> {
        let mut inner = self.lock();
        self.begin(
            &mut inner,
            Call {
                op: CallKind::List,
                kind: kind.name().to_string(),
                id: None,
                patch: None,
                page_token: page_token.map(str::to_string),
            },
        )?;

        let offset = match page_token {
            Some(t) => t
                .parse::<usize>()
                .map_err(|_| ClientError::rejected(format!("invalid page token '{}'", t)))?,
            None => 0,
        };

        let matching: Vec<&String> = inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .objects
                    .get(*id)
                    .is_some_and(|o| o.kind == kind.name() && in_scope(o, scope))
            })
            .collect();

        let records = matching
            .iter()
            .skip(offset)
            .take(self.page_size)
            .filter_map(|id| inner.objects.get(*id).map(|o| self.observe(id, o)))
            .collect();

        let end = offset + self.page_size;
        let next_page = match self.paging {
            Paging::Stuck => Some(offset.max(1).to_string()),
            Paging::Cyclic => Some(if offset == 1 { "2" } else { "1" }.to_string()),
            Paging::Offsets if end < matching.len() => Some(end.to_string()),
            Paging::Offsets => None,
        };

        Ok(Page { records, next_page })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::drg;

    fn attrs(compartment: &str) -> Attributes {
        let mut a = Attributes::new();
        a.insert("compartment_id".to_string(), Value::string(compartment));
        a
    }

    #[tokio::test]
    async fn test_create_settles_after_reads() {
        let cloud = MemoryCloud::new().with_transition_reads(2);
        let kind = drg();
        let id = cloud.create(&kind, &attrs("A")).await.unwrap();

        let states: Vec<String> = [
            cloud.read(&kind, &id).await.unwrap(),
            cloud.read(&kind, &id).await.unwrap(),
            cloud.read(&kind, &id).await.unwrap(),
        ]
        .into_iter()
        .map(|o| o.lifecycle.as_str().to_string())
        .collect();
        assert_eq!(states, vec!["PROVISIONING", "PROVISIONING", "AVAILABLE"]);
    }

    #[tokio::test]
    async fn test_delete_ends_in_not_found() {
        let cloud = MemoryCloud::new().with_transition_reads(1);
        let kind = drg();
        let id = cloud.insert(kind.name(), "AVAILABLE", attrs("A"));
        cloud.delete(&kind, &id).await.unwrap();

        let obs = cloud.read(&kind, &id).await.unwrap();
        assert_eq!(obs.lifecycle.as_str(), "TERMINATING");
        assert!(cloud.read(&kind, &id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failing_delete_ends_in_failed() {
        let cloud = MemoryCloud::new().with_failing_deletes();
        let kind = drg();
        let id = cloud.insert(kind.name(), "AVAILABLE", attrs("A"));
        cloud.delete(&kind, &id).await.unwrap();

        let states: Vec<String> = [
            cloud.read(&kind, &id).await.unwrap(),
            cloud.read(&kind, &id).await.unwrap(),
        ]
        .into_iter()
        .map(|o| o.lifecycle.as_str().to_string())
        .collect();
        assert_eq!(states, vec!["TERMINATING", "FAILED"]);
    }

    #[tokio::test]
    async fn test_fault_injection_is_consumed_once() {
        let cloud = MemoryCloud::new();
        let kind = drg();
        let id = cloud.insert(kind.name(), "AVAILABLE", attrs("A"));
        cloud.fail_next(CallKind::Read, ClientError::transient("throttled"));

        assert!(cloud.read(&kind, &id).await.unwrap_err().is_transient());
        assert!(cloud.read(&kind, &id).await.is_ok());
        assert_eq!(cloud.calls_of(CallKind::Read).len(), 2);
    }

    #[tokio::test]
    async fn test_list_pages_by_scope() {
        let cloud = MemoryCloud::new().with_page_size(2);
        let kind = drg();
        for _ in 0..3 {
            cloud.insert(kind.name(), "AVAILABLE", attrs("A"));
        }
        cloud.insert(kind.name(), "AVAILABLE", attrs("B"));

        let scope = Scope::new().with("compartment_id", "A");
        let first = cloud.list(&kind, &scope, None).await.unwrap();
        assert_eq!(first.records.len(), 2);
        let token = first.next_page.unwrap();
        let second = cloud.list(&kind, &scope, Some(&token)).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.next_page.is_none());
    }
}
