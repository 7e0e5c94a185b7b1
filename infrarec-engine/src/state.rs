//! Desired configuration supplied by the caller and remote state owned by
//! the reconciler.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::Observation;
use crate::schema::{Attributes, LifecycleState, ObjectKind, Value};

/// Lifecycle tag of a state that was never read back.
pub const UNOBSERVED: &str = "UNOBSERVED";

/// Lifecycle tag of an object the engine deleted itself. Classifies as
/// absent for every kind that does not declare it otherwise.
pub const GONE: &str = "GONE";

/// Declared intent for one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredValue {
    Set(Value),
    /// Explicitly unset. Omitting an attribute means "no intent", not this.
    Clear,
}

/// Patch sent with an in-place update: exactly the changed mutable attributes.
pub type Patch = BTreeMap<String, DesiredValue>;

/// Caller-supplied configuration for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DesiredConfiguration {
    values: BTreeMap<String, DesiredValue>,
}

impl DesiredConfiguration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values
            .insert(name.to_string(), DesiredValue::Set(value.into()));
        self
    }

    pub fn clear(mut self, name: &str) -> Self {
        self.values.insert(name.to_string(), DesiredValue::Clear);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: DesiredValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&DesiredValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DesiredValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, Value)> for DesiredConfiguration {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k, DesiredValue::Set(v)))
                .collect(),
        }
    }
}

/// Last-known state of one remote object.
///
/// Replaced wholesale on every successful read. Callers persist it between
/// invocations; its serialized form is not interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteState {
    pub kind: String,
    pub id: String,
    pub lifecycle: LifecycleState,
    pub attributes: Attributes,
    pub observed_at: DateTime<Utc>,
}

impl RemoteState {
    /// Build the canonical state from a raw observation.
    pub fn from_observation(kind: &ObjectKind, observation: Observation) -> Self {
        Self {
            kind: kind.name().to_string(),
            id: observation.id,
            lifecycle: observation.lifecycle,
            attributes: kind.canonicalize(observation.attributes),
            observed_at: Utc::now(),
        }
    }

    /// State for an object known only by identifier: created, but never
    /// read back. Its lifecycle is unknown, so the next reconcile resumes
    /// polling it.
    pub fn unobserved(kind: &ObjectKind, id: &str) -> Self {
        Self {
            kind: kind.name().to_string(),
            id: id.to_string(),
            lifecycle: LifecycleState::new(UNOBSERVED),
            attributes: Attributes::new(),
            observed_at: Utc::now(),
        }
    }

    /// State for an object whose deletion was confirmed. Reconciling it
    /// creates a new object.
    pub fn gone(kind: &ObjectKind, id: &str) -> Self {
        Self {
            kind: kind.name().to_string(),
            id: id.to_string(),
            lifecycle: LifecycleState::new(GONE),
            attributes: Attributes::new(),
            observed_at: Utc::now(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desired_builder() {
        let desired = DesiredConfiguration::new()
            .set("display_name", "a")
            .clear("description");
        assert_eq!(desired.len(), 2);
        assert_eq!(
            desired.get("display_name"),
            Some(&DesiredValue::Set(Value::string("a")))
        );
        assert_eq!(desired.get("description"), Some(&DesiredValue::Clear));
        assert!(desired.get("other").is_none());
    }

    #[test]
    fn test_desired_serde_shape() {
        let desired = DesiredConfiguration::new()
            .set("display_name", "a")
            .clear("description");
        let json = serde_json::to_value(&desired).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "description": "clear",
                "display_name": { "set": "a" }
            })
        );
        let back: DesiredConfiguration = serde_json::from_value(json).unwrap();
        assert_eq!(back, desired);
    }
}
