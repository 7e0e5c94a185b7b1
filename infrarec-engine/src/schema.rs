//! Attribute schema: per-kind field declarations, lifecycle state classes
//! and validation of desired configuration.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ValidationError;
use crate::poller::PollConfig;
use crate::state::{DesiredConfiguration, DesiredValue};

/// Attribute value as exchanged with the remote client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    String(String),
    Set(BTreeSet<String>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Set(items.into_iter().map(Into::into).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::String(_) => "string",
            Value::Set(_) => "set of strings",
            Value::Object(_) => "object",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i64::from(i))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Canonical attribute bundle.
pub type Attributes = BTreeMap<String, Value>;

/// Semantic type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    String,
    Integer,
    Bool,
    StringSet,
    Object(Vec<Attribute>),
}

impl AttributeType {
    fn name(&self) -> &'static str {
        match self {
            AttributeType::String => "string",
            AttributeType::Integer => "integer",
            AttributeType::Bool => "boolean",
            AttributeType::StringSet => "set of strings",
            AttributeType::Object(_) => "object",
        }
    }

    /// Shallow type check; nested objects are checked by `check_value`.
    fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (AttributeType::String, Value::String(_))
                | (AttributeType::Integer, Value::Integer(_))
                | (AttributeType::Bool, Value::Bool(_))
                | (AttributeType::StringSet, Value::Set(_))
                | (AttributeType::Object(_), Value::Object(_))
        )
    }

    /// Type-aware equality of a desired value against an observed one.
    ///
    /// Sets compare without regard to order. Objects compare attribute by
    /// attribute over the nested schema: nested computed attributes and
    /// nested attributes the desired side leaves out are ignored.
    pub fn matches(&self, desired: &Value, current: &Value) -> bool {
        match (self, desired, current) {
            (AttributeType::Object(nested), Value::Object(want), Value::Object(have)) => {
                nested
                    .iter()
                    .filter(|a| a.mutability != Mutability::Computed)
                    .all(|a| match (want.get(&a.name), have.get(&a.name)) {
                        (None, _) => true,
                        (Some(w), Some(h)) => a.ty.matches(w, h),
                        (Some(_), None) => false,
                    })
            }
            _ => desired == current,
        }
    }
}

/// How a change to an attribute is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mutability {
    /// Force-new: a change requires destroy and recreate.
    Immutable,
    /// Updatable in place.
    Mutable,
    /// Read-only, reported by the remote side.
    Computed,
}

/// Validation rule attached to an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    NonEmpty,
    OneOf(Vec<String>),
    Range { min: i64, max: i64 },
    MaxLength(usize),
}

impl Rule {
    fn check(&self, value: &Value) -> bool {
        match (self, value) {
            (Rule::NonEmpty, Value::String(s)) => !s.trim().is_empty(),
            (Rule::NonEmpty, Value::Set(s)) => !s.is_empty(),
            (Rule::NonEmpty, Value::Object(o)) => !o.is_empty(),
            (Rule::OneOf(allowed), Value::String(s)) => allowed.iter().any(|a| a == s),
            (Rule::Range { min, max }, Value::Integer(i)) => (*min..=*max).contains(i),
            (Rule::MaxLength(max), Value::String(s)) => s.chars().count() <= *max,
            (Rule::MaxLength(max), Value::Set(s)) => s.len() <= *max,
            // Rules do not apply across types; the type check reports those.
            _ => true,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::NonEmpty => write!(f, "must not be empty"),
            Rule::OneOf(allowed) => write!(f, "must be one of [{}]", allowed.join(", ")),
            Rule::Range { min, max } => write!(f, "must be between {} and {}", min, max),
            Rule::MaxLength(max) => write!(f, "must be at most {} long", max),
        }
    }
}

/// One field of an object kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub ty: AttributeType,
    pub mutability: Mutability,
    pub required: bool,
    pub default: Option<Value>,
    pub rules: Vec<Rule>,
}

impl Attribute {
    fn new(name: &str, ty: AttributeType, mutability: Mutability) -> Self {
        Self {
            name: name.to_string(),
            ty,
            mutability,
            required: false,
            default: None,
            rules: Vec::new(),
        }
    }

    pub fn immutable(name: &str, ty: AttributeType) -> Self {
        Self::new(name, ty, Mutability::Immutable)
    }

    pub fn mutable(name: &str, ty: AttributeType) -> Self {
        Self::new(name, ty, Mutability::Mutable)
    }

    pub fn computed(name: &str, ty: AttributeType) -> Self {
        Self::new(name, ty, Mutability::Computed)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Check a configured value against type, rules and nested schema.
    fn check_value(&self, path: &str, value: &Value) -> Result<(), ValidationError> {
        if !self.ty.accepts(value) {
            return Err(ValidationError::TypeMismatch {
                attribute: path.to_string(),
                expected: self.ty.name().to_string(),
                found: value.type_name().to_string(),
            });
        }

        if let Some(rule) = self.rules.iter().find(|r| !r.check(value)) {
            return Err(ValidationError::RuleViolation {
                attribute: path.to_string(),
                rule: rule.to_string(),
            });
        }

        if let (AttributeType::Object(nested), Value::Object(fields)) = (&self.ty, value) {
            for (name, field) in fields {
                let child_path = format!("{}.{}", path, name);
                let child = nested
                    .iter()
                    .find(|a| &a.name == name)
                    .ok_or_else(|| ValidationError::UnknownAttribute(child_path.clone()))?;
                if child.mutability == Mutability::Computed {
                    return Err(ValidationError::ComputedAttribute(child_path));
                }
                child.check_value(&child_path, field)?;
            }
            for child in nested.iter().filter(|a| a.required) {
                if !fields.contains_key(&child.name) {
                    return Err(ValidationError::MissingRequired(format!(
                        "{}.{}",
                        path, child.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Remote-reported lifecycle tag, e.g. `PROVISIONING` or `AVAILABLE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LifecycleState(String);

impl LifecycleState {
    pub fn new(state: impl Into<String>) -> Self {
        Self(state.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LifecycleState {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// How an object kind interprets a lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateClass {
    /// Transitioning towards the target.
    Pending,
    /// Terminal success.
    Target,
    /// Terminal failure.
    Failed,
    /// Delete in progress.
    Deleting,
    /// Terminal after delete; the object may remain readable for a while.
    Absent,
    /// Not declared by the kind; treated as still transitioning.
    Unknown,
}

/// Immutable descriptor of one remote object kind.
#[derive(Debug, Clone)]
pub struct ObjectKind {
    name: String,
    attributes: Vec<Attribute>,
    pending_states: Vec<LifecycleState>,
    target_states: Vec<LifecycleState>,
    failed_states: Vec<LifecycleState>,
    deleting_states: Vec<LifecycleState>,
    absent_states: Vec<LifecycleState>,
    scope_attribute: Option<String>,
    discovery_only: bool,
    poll: PollConfig,
}

impl ObjectKind {
    pub fn builder(name: &str) -> ObjectKindBuilder {
        ObjectKindBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attributes in declaration order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn scope_attribute(&self) -> Option<&str> {
        self.scope_attribute.as_deref()
    }

    pub fn is_discovery_only(&self) -> bool {
        self.discovery_only
    }

    pub fn poll_defaults(&self) -> &PollConfig {
        &self.poll
    }

    pub fn classify(&self, state: &LifecycleState) -> StateClass {
        if self.target_states.contains(state) {
            StateClass::Target
        } else if self.failed_states.contains(state) {
            StateClass::Failed
        } else if self.absent_states.contains(state) {
            StateClass::Absent
        } else if self.deleting_states.contains(state) {
            StateClass::Deleting
        } else if self.pending_states.contains(state) {
            StateClass::Pending
        } else if state.as_str() == crate::state::GONE {
            StateClass::Absent
        } else {
            StateClass::Unknown
        }
    }

    pub fn is_target(&self, state: &LifecycleState) -> bool {
        self.classify(state) == StateClass::Target
    }

    pub fn is_failed(&self, state: &LifecycleState) -> bool {
        self.classify(state) == StateClass::Failed
    }

    pub fn is_absent(&self, state: &LifecycleState) -> bool {
        self.classify(state) == StateClass::Absent
    }

    /// Check the schema itself: unique names, sane computed attributes,
    /// well-typed defaults, non-empty target states.
    pub fn check_schema(&self) -> Result<(), ValidationError> {
        check_attributes(&self.attributes)?;

        if !self.discovery_only && self.target_states.is_empty() {
            return Err(ValidationError::InvalidSchema(format!(
                "kind '{}' declares no target state",
                self.name
            )));
        }

        if let Some(scope) = &self.scope_attribute {
            match self.attribute(scope) {
                Some(a) if a.ty == AttributeType::String => {}
                _ => {
                    return Err(ValidationError::InvalidSchema(format!(
                        "scope attribute '{}' must be a declared string attribute",
                        scope
                    )));
                }
            }
        }

        Ok(())
    }

    /// Validate caller-supplied configuration. Runs before any remote call.
    pub fn validate(&self, desired: &DesiredConfiguration) -> Result<(), ValidationError> {
        if self.discovery_only {
            return Err(ValidationError::DiscoveryOnly(self.name.clone()));
        }

        for (name, value) in desired.iter() {
            let attr = self
                .attribute(name)
                .ok_or_else(|| ValidationError::UnknownAttribute(name.to_string()))?;

            if attr.mutability == Mutability::Computed {
                return Err(ValidationError::ComputedAttribute(name.to_string()));
            }

            match value {
                DesiredValue::Set(v) => attr.check_value(name, v)?,
                DesiredValue::Clear if attr.required => {
                    return Err(ValidationError::CannotClearRequired(name.to_string()));
                }
                DesiredValue::Clear => {}
            }
        }

        for attr in self.attributes.iter().filter(|a| a.required) {
            if !matches!(desired.get(&attr.name), Some(DesiredValue::Set(_))) {
                return Err(ValidationError::MissingRequired(attr.name.clone()));
            }
        }

        Ok(())
    }

    /// Attributes for a create call: configured values plus defaults for
    /// optional attributes the configuration leaves out.
    pub fn create_payload(&self, desired: &DesiredConfiguration) -> Attributes {
        self.attributes
            .iter()
            .filter(|a| a.mutability != Mutability::Computed)
            .filter_map(|a| match desired.get(&a.name) {
                Some(DesiredValue::Set(v)) => Some((a.name.clone(), v.clone())),
                Some(DesiredValue::Clear) => None,
                None => a.default.clone().map(|d| (a.name.clone(), d)),
            })
            .collect()
    }

    /// Keep only attributes the schema declares.
    pub fn canonicalize(&self, raw: Attributes) -> Attributes {
        raw.into_iter()
            .filter(|(name, _)| {
                let known = self.attribute(name).is_some();
                if !known {
                    debug!(kind = %self.name, attribute = %name, "Dropping undeclared attribute");
                }
                known
            })
            .collect()
    }
}

fn check_attributes(attributes: &[Attribute]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for attr in attributes {
        if !seen.insert(attr.name.as_str()) {
            return Err(ValidationError::DuplicateAttribute(attr.name.clone()));
        }
        if attr.mutability == Mutability::Computed && (attr.required || attr.default.is_some()) {
            return Err(ValidationError::InvalidSchema(format!(
                "computed attribute '{}' cannot be required or defaulted",
                attr.name
            )));
        }
        if let Some(default) = &attr.default {
            attr.check_value(&attr.name, default)?;
        }
        if let AttributeType::Object(nested) = &attr.ty {
            check_attributes(nested)?;
        }
    }
    Ok(())
}

/// Builder for [`ObjectKind`].
pub struct ObjectKindBuilder {
    kind: ObjectKind,
}

impl ObjectKindBuilder {
    fn new(name: &str) -> Self {
        Self {
            kind: ObjectKind {
                name: name.to_string(),
                attributes: Vec::new(),
                pending_states: Vec::new(),
                target_states: Vec::new(),
                failed_states: Vec::new(),
                deleting_states: Vec::new(),
                absent_states: Vec::new(),
                scope_attribute: None,
                discovery_only: false,
                poll: PollConfig::default(),
            },
        }
    }

    pub fn attribute(mut self, attribute: Attribute) -> Self {
        self.kind.attributes.push(attribute);
        self
    }

    pub fn pending_states(mut self, states: &[&str]) -> Self {
        self.kind.pending_states = states.iter().map(|s| LifecycleState::new(*s)).collect();
        self
    }

    pub fn target_states(mut self, states: &[&str]) -> Self {
        self.kind.target_states = states.iter().map(|s| LifecycleState::new(*s)).collect();
        self
    }

    pub fn failed_states(mut self, states: &[&str]) -> Self {
        self.kind.failed_states = states.iter().map(|s| LifecycleState::new(*s)).collect();
        self
    }

    pub fn deleting_states(mut self, states: &[&str]) -> Self {
        self.kind.deleting_states = states.iter().map(|s| LifecycleState::new(*s)).collect();
        self
    }

    pub fn absent_states(mut self, states: &[&str]) -> Self {
        self.kind.absent_states = states.iter().map(|s| LifecycleState::new(*s)).collect();
        self
    }

    pub fn scope(mut self, attribute: &str) -> Self {
        self.kind.scope_attribute = Some(attribute.to_string());
        self
    }

    pub fn discovery_only(mut self) -> Self {
        self.kind.discovery_only = true;
        self
    }

    pub fn poll(mut self, poll: PollConfig) -> Self {
        self.kind.poll = poll;
        self
    }

    pub fn build(self) -> ObjectKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener_kind() -> ObjectKind {
        ObjectKind::builder("test_listener")
            .attribute(
                Attribute::immutable("compartment_id", AttributeType::String)
                    .required()
                    .rule(Rule::NonEmpty),
            )
            .attribute(
                Attribute::mutable("protocol", AttributeType::String)
                    .default_value("HTTP")
                    .rule(Rule::OneOf(vec!["HTTP".to_string(), "TCP".to_string()])),
            )
            .attribute(
                Attribute::mutable("port", AttributeType::Integer)
                    .rule(Rule::Range { min: 1, max: 65535 }),
            )
            .attribute(Attribute::mutable(
                "health_check",
                AttributeType::Object(vec![
                    Attribute::mutable("path", AttributeType::String).required(),
                    Attribute::mutable("interval_ms", AttributeType::Integer),
                    Attribute::computed("last_result", AttributeType::String),
                ]),
            ))
            .attribute(Attribute::computed("state", AttributeType::String))
            .pending_states(&["CREATING"])
            .target_states(&["ACTIVE"])
            .failed_states(&["FAILED"])
            .deleting_states(&["DELETING"])
            .absent_states(&["DELETED"])
            .scope("compartment_id")
            .build()
    }

    #[test]
    fn test_schema_is_valid() {
        assert!(listener_kind().check_schema().is_ok());
    }

    #[test]
    fn test_duplicate_attribute_rejected() {
        let kind = ObjectKind::builder("dup")
            .attribute(Attribute::mutable("a", AttributeType::String))
            .attribute(Attribute::immutable("a", AttributeType::String))
            .target_states(&["ACTIVE"])
            .build();
        assert_eq!(
            kind.check_schema(),
            Err(ValidationError::DuplicateAttribute("a".to_string()))
        );
    }

    #[test]
    fn test_computed_required_rejected() {
        let kind = ObjectKind::builder("bad")
            .attribute(Attribute::computed("id", AttributeType::String).required())
            .target_states(&["ACTIVE"])
            .build();
        assert!(matches!(
            kind.check_schema(),
            Err(ValidationError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_classify_states() {
        let kind = listener_kind();
        assert_eq!(kind.classify(&"CREATING".into()), StateClass::Pending);
        assert_eq!(kind.classify(&"ACTIVE".into()), StateClass::Target);
        assert_eq!(kind.classify(&"FAILED".into()), StateClass::Failed);
        assert_eq!(kind.classify(&"DELETING".into()), StateClass::Deleting);
        assert_eq!(kind.classify(&"DELETED".into()), StateClass::Absent);
        assert_eq!(kind.classify(&"MIGRATING".into()), StateClass::Unknown);
        assert_eq!(kind.classify(&crate::state::GONE.into()), StateClass::Absent);
    }

    #[test]
    fn test_validate_missing_required() {
        let kind = listener_kind();
        let desired = DesiredConfiguration::new().set("port", 80);
        assert_eq!(
            kind.validate(&desired),
            Err(ValidationError::MissingRequired("compartment_id".to_string()))
        );
    }

    #[test]
    fn test_validate_computed_rejected() {
        let kind = listener_kind();
        let desired = DesiredConfiguration::new()
            .set("compartment_id", "c1")
            .set("state", "ACTIVE");
        assert_eq!(
            kind.validate(&desired),
            Err(ValidationError::ComputedAttribute("state".to_string()))
        );
    }

    #[test]
    fn test_validate_type_and_rules() {
        let kind = listener_kind();

        let desired = DesiredConfiguration::new()
            .set("compartment_id", "c1")
            .set("port", "eighty");
        assert!(matches!(
            kind.validate(&desired),
            Err(ValidationError::TypeMismatch { .. })
        ));

        let desired = DesiredConfiguration::new()
            .set("compartment_id", "c1")
            .set("port", 70000);
        assert!(matches!(
            kind.validate(&desired),
            Err(ValidationError::RuleViolation { .. })
        ));

        let desired = DesiredConfiguration::new()
            .set("compartment_id", "c1")
            .set("protocol", "UDP");
        assert!(matches!(
            kind.validate(&desired),
            Err(ValidationError::RuleViolation { .. })
        ));
    }

    #[test]
    fn test_validate_clear_required() {
        let kind = listener_kind();
        let desired = DesiredConfiguration::new().clear("compartment_id");
        assert_eq!(
            kind.validate(&desired),
            Err(ValidationError::CannotClearRequired(
                "compartment_id".to_string()
            ))
        );
    }

    #[test]
    fn test_validate_nested_object() {
        let kind = listener_kind();

        let mut check = BTreeMap::new();
        check.insert("interval_ms".to_string(), Value::Integer(1000));
        let desired = DesiredConfiguration::new()
            .set("compartment_id", "c1")
            .set("health_check", Value::Object(check.clone()));
        assert_eq!(
            kind.validate(&desired),
            Err(ValidationError::MissingRequired(
                "health_check.path".to_string()
            ))
        );

        check.insert("path".to_string(), Value::string("/healthz"));
        check.insert("last_result".to_string(), Value::string("OK"));
        let desired = DesiredConfiguration::new()
            .set("compartment_id", "c1")
            .set("health_check", Value::Object(check));
        assert_eq!(
            kind.validate(&desired),
            Err(ValidationError::ComputedAttribute(
                "health_check.last_result".to_string()
            ))
        );
    }

    #[test]
    fn test_create_payload_applies_defaults() {
        let kind = listener_kind();
        let desired = DesiredConfiguration::new().set("compartment_id", "c1");
        let payload = kind.create_payload(&desired);
        assert_eq!(payload.get("compartment_id"), Some(&Value::string("c1")));
        assert_eq!(payload.get("protocol"), Some(&Value::string("HTTP")));
        assert!(!payload.contains_key("port"));
        assert!(!payload.contains_key("state"));
    }

    #[test]
    fn test_set_matches_ignore_order() {
        let a = Value::set(["b", "a"]);
        let b = Value::set(["a", "b"]);
        assert!(AttributeType::StringSet.matches(&a, &b));
    }

    #[test]
    fn test_object_matches_ignores_computed_and_omitted() {
        let ty = listener_kind()
            .attribute("health_check")
            .map(|a| a.ty.clone())
            .unwrap();

        let mut want = BTreeMap::new();
        want.insert("path".to_string(), Value::string("/healthz"));
        let mut have = want.clone();
        have.insert("interval_ms".to_string(), Value::Integer(5000));
        have.insert("last_result".to_string(), Value::string("OK"));

        assert!(ty.matches(&Value::Object(want.clone()), &Value::Object(have.clone())));

        want.insert("interval_ms".to_string(), Value::Integer(1000));
        assert!(!ty.matches(&Value::Object(want), &Value::Object(have)));
    }

    #[test]
    fn test_canonicalize_drops_undeclared() {
        let kind = listener_kind();
        let mut raw = Attributes::new();
        raw.insert("compartment_id".to_string(), Value::string("c1"));
        raw.insert("etag".to_string(), Value::string("W/123"));
        let canonical = kind.canonicalize(raw);
        assert!(canonical.contains_key("compartment_id"));
        assert!(!canonical.contains_key("etag"));
    }

    #[test]
    fn test_value_deserializes_untagged() {
        let v: Value = serde_json::from_str(r#"["x","y","x"]"#).unwrap();
        assert_eq!(v, Value::set(["x", "y"]));
        let v: Value = serde_json::from_str("42").unwrap();
        assert_eq!(v, Value::Integer(42));
        let v: Value = serde_json::from_str(r#"{"path":"/"}"#).unwrap();
        assert!(matches!(v, Value::Object(_)));
    }
}
