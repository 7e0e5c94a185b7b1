pub mod audit;
pub mod client;
pub mod config;
pub mod error;
pub mod fleet;
pub mod kinds;
pub mod logging;
pub mod plan;
pub mod poller;
pub mod query;
pub mod reconciler;
pub mod schema;
pub mod state;
pub mod test_util;

pub use audit::{AuditEvent, AuditSink, NoopAudit, TracingAudit};
pub use client::{Observation, Page, RemoteClient, Scope};
pub use config::EngineConfig;
pub use error::{ClientError, EngineError, ErrorClass, ErrorContext, Operation, Result, ValidationError};
pub use fleet::{ApplyReport, Fleet, InstanceSpec, Manifest};
pub use kinds::Catalog;
pub use plan::{Action, ReconciliationPlan, plan};
pub use poller::{NotFoundPolicy, OperationContext, PollConfig, PollResult, poll_until_stable};
pub use query::{Filter, RecordStream};
pub use reconciler::{Phase, Reconciler};
pub use schema::{Attribute, AttributeType, LifecycleState, Mutability, ObjectKind, Rule, StateClass, Value};
pub use state::{DesiredConfiguration, DesiredValue, Patch, RemoteState};
