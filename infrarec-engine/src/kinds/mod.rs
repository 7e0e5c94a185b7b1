//! Object kind descriptors and the catalog that maps kind names to them.
//!
//! Each kind lives in its own file and declares its attributes, lifecycle
//! states and polling defaults.

pub mod drg;
pub mod load_balancer_shape;
pub mod remote_peering_connection;
pub mod role;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::ValidationError;
use crate::schema::ObjectKind;

pub use drg::drg;
pub use load_balancer_shape::load_balancer_shape;
pub use remote_peering_connection::remote_peering_connection;
pub use role::identity_role;

/// Registered object kinds, keyed by name.
///
/// Passed explicitly to whatever needs to resolve a kind name (e.g. when
/// pruning persisted state); there is no process-wide registry.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    kinds: BTreeMap<String, Arc<ObjectKind>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with every kind shipped in this crate.
    pub fn builtin() -> Result<Self, ValidationError> {
        let mut catalog = Self::new();
        catalog.register(remote_peering_connection())?;
        catalog.register(drg())?;
        catalog.register(load_balancer_shape())?;
        catalog.register(identity_role())?;
        Ok(catalog)
    }

    /// Check a kind's schema and add it.
    pub fn register(&mut self, kind: ObjectKind) -> Result<Arc<ObjectKind>, ValidationError> {
        kind.check_schema()?;
        if self.kinds.contains_key(kind.name()) {
            return Err(ValidationError::InvalidSchema(format!(
                "kind '{}' registered twice",
                kind.name()
            )));
        }
        let kind = Arc::new(kind);
        self.kinds
            .insert(kind.name().to_string(), Arc::clone(&kind));
        Ok(kind)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ObjectKind>> {
        self.kinds.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_are_valid() {
        let catalog = Catalog::builtin().unwrap();
        let names: Vec<&str> = catalog.names().collect();
        assert_eq!(
            names,
            vec![
                "core_drg",
                "core_remote_peering_connection",
                "identity_role",
                "load_balancer_shape",
            ]
        );
    }

    #[test]
    fn test_register_twice_fails() {
        let mut catalog = Catalog::new();
        catalog.register(drg()).unwrap();
        assert!(matches!(
            catalog.register(drg()),
            Err(ValidationError::InvalidSchema(_))
        ));
    }

    #[test]
    fn test_shapes_are_discovery_only() {
        let catalog = Catalog::builtin().unwrap();
        let shapes = catalog.get(load_balancer_shape::KIND).unwrap();
        assert!(shapes.is_discovery_only());
        assert_eq!(shapes.scope_attribute(), Some("compartment_id"));
    }
}
