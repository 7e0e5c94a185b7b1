//! Diff & plan: decides between no-op, in-place update and replacement.

use std::fmt;

use serde::Serialize;

use crate::schema::{Mutability, ObjectKind};
use crate::state::{DesiredConfiguration, DesiredValue, Patch, RemoteState};

/// What a reconciliation must do to an existing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    NoOp,
    UpdateInPlace,
    /// Destroy, then create a new object with a new identifier.
    Replace,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::NoOp => "no-op",
            Action::UpdateInPlace => "update in place",
            Action::Replace => "replace",
        };
        f.write_str(s)
    }
}

/// Result of comparing desired configuration with last-known state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    pub action: Action,
    /// Changed attributes in schema declaration order.
    pub changed: Vec<String>,
    /// The immutable subset of `changed`; non-empty iff `action` is `Replace`.
    pub immutable_changed: Vec<String>,
    /// Changed mutable attributes and their new values.
    pub patch: Patch,
}

impl ReconciliationPlan {
    pub fn is_noop(&self) -> bool {
        self.action == Action::NoOp
    }
}

/// Compare `desired` against `current` attribute by attribute.
///
/// Only attributes present in `desired` are compared; computed attributes
/// never are. `Clear` counts as a change only when `current` has a value.
pub fn plan(
    kind: &ObjectKind,
    desired: &DesiredConfiguration,
    current: &RemoteState,
) -> ReconciliationPlan {
    let mut changed = Vec::new();
    let mut immutable_changed = Vec::new();
    let mut patch = Patch::new();

    for attr in kind.attributes() {
        if attr.mutability == Mutability::Computed {
            continue;
        }
        let Some(want) = desired.get(&attr.name) else {
            continue;
        };

        let differs = match (want, current.get(&attr.name)) {
            (DesiredValue::Set(v), Some(have)) => !attr.ty.matches(v, have),
            (DesiredValue::Set(_), None) => true,
            (DesiredValue::Clear, Some(_)) => true,
            (DesiredValue::Clear, None) => false,
        };
        if !differs {
            continue;
        }

        changed.push(attr.name.clone());
        match attr.mutability {
            Mutability::Immutable => immutable_changed.push(attr.name.clone()),
            Mutability::Mutable => {
                patch.insert(attr.name.clone(), want.clone());
            }
            Mutability::Computed => {}
        }
    }

    let action = if !immutable_changed.is_empty() {
        Action::Replace
    } else if !changed.is_empty() {
        Action::UpdateInPlace
    } else {
        Action::NoOp
    };

    ReconciliationPlan {
        action,
        changed,
        immutable_changed,
        patch,
    }
}
