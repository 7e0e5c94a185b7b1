//! Remote object client capability.
//!
//! The engine never talks to a cloud API directly. A front end supplies one
//! [`RemoteClient`] handle, shared by every reconciliation of the session;
//! per-kind dispatch happens inside the client based on the [`ObjectKind`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientError;
use crate::schema::{Attributes, LifecycleState, ObjectKind};
use crate::state::Patch;

/// Raw result of a read or list call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub lifecycle: LifecycleState,
    pub attributes: Attributes,
}

/// One page of a list call.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Observation>,
    /// Token for the next page; `None` on the last page.
    pub next_page: Option<String>,
}

/// Scope parameters for list calls, e.g. the containing compartment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope {
    params: BTreeMap<String, String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// CRUD and list calls against the remote API.
///
/// Implementations must be reentrant: independent reconciliations call the
/// same handle concurrently. Every error must be classified.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Create an object and return its opaque identifier.
    async fn create(&self, kind: &ObjectKind, attributes: &Attributes)
    -> Result<String, ClientError>;

    /// Read an object. Missing objects return a `NotFound` error.
    async fn read(&self, kind: &ObjectKind, id: &str) -> Result<Observation, ClientError>;

    /// Apply a partial update.
    async fn update(&self, kind: &ObjectKind, id: &str, patch: &Patch) -> Result<(), ClientError>;

    /// Request deletion. Completion is observed by polling.
    async fn delete(&self, kind: &ObjectKind, id: &str) -> Result<(), ClientError>;

    /// List one page of objects within a scope.
    async fn list(
        &self,
        kind: &ObjectKind,
        scope: &Scope,
        page_token: Option<&str>,
    ) -> Result<Page, ClientError>;
}
