//! Error types for the reconciliation engine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::LifecycleState;
use crate::state::RemoteState;

/// Classification a [`RemoteClient`](crate::client::RemoteClient) attaches to every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Retryable (throttling, connection reset, 5xx with retry hint).
    Transient,
    /// The object does not exist (or is not visible yet).
    NotFound,
    /// Rejected request: auth failure, malformed input, quota.
    PermanentClient,
    /// Remote side failed in a way retrying will not fix.
    PermanentServer,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::NotFound => "not found",
            ErrorClass::PermanentClient => "rejected",
            ErrorClass::PermanentServer => "remote failure",
        };
        f.write_str(s)
    }
}

/// Error returned by a remote object client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct ClientError {
    pub class: ErrorClass,
    pub message: String,
}

impl ClientError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::PermanentClient, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::PermanentServer, message)
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.class == ErrorClass::NotFound
    }

    pub fn is_permanent(&self) -> bool {
        matches!(
            self.class,
            ErrorClass::PermanentClient | ErrorClass::PermanentServer
        )
    }
}

/// Desired configuration (or a filter) does not satisfy the kind's schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("attribute '{0}' is computed and cannot be configured")]
    ComputedAttribute(String),

    #[error("required attribute '{0}' is missing")]
    MissingRequired(String),

    #[error("required attribute '{0}' cannot be cleared")]
    CannotClearRequired(String),

    #[error("attribute '{attribute}' expects {expected}, got {found}")]
    TypeMismatch {
        attribute: String,
        expected: String,
        found: String,
    },

    #[error("attribute '{attribute}' violates rule: {rule}")]
    RuleViolation { attribute: String, rule: String },

    #[error("cannot filter on undeclared attribute '{0}'")]
    UnknownFilterAttribute(String),

    #[error("duplicate attribute '{0}' in schema")]
    DuplicateAttribute(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("kind '{0}' only supports discovery")]
    DiscoveryOnly(String),
}

/// Operation the engine was performing when an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    List,
    Poll,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::List => "list",
            Operation::Poll => "poll",
        };
        f.write_str(s)
    }
}

/// Where an error happened: enough for a caller to decide between
/// re-invoking and manual intervention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub kind: String,
    pub id: Option<String>,
    pub operation: Operation,
    pub last_state: Option<LifecycleState>,
}

impl ErrorContext {
    pub fn new(kind: impl Into<String>, operation: Operation) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            operation,
            last_state: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_state(mut self, state: Option<LifecycleState>) -> Self {
        self.last_state = state;
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.operation,
            self.kind,
            self.id.as_deref().unwrap_or("<new>")
        )?;
        if let Some(state) = &self.last_state {
            write!(f, " (last state {})", state)?;
        }
        Ok(())
    }
}

/// Errors surfaced by the engine to its caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Desired configuration violates the schema. Nothing was sent.
    #[error("invalid configuration for {kind}: {source}")]
    Validation {
        kind: String,
        #[source]
        source: ValidationError,
    },

    /// Missing scope or identifier. Nothing was sent.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A mutating call failed transiently. It is not retried automatically.
    #[error("transient error during {context}: {source}")]
    TransientRemote {
        context: ErrorContext,
        #[source]
        source: ClientError,
    },

    /// Remote side rejected the request or the object entered a failed state.
    #[error("remote failure during {context}: {source}")]
    PermanentRemote {
        context: ErrorContext,
        #[source]
        source: ClientError,
    },

    /// Outcome unknown: the object may still converge.
    #[error("timed out after {elapsed:?} during {context}")]
    PollTimeout {
        context: ErrorContext,
        elapsed: Duration,
        last_observed: Option<Box<RemoteState>>,
    },

    /// The remote object disappeared or changed outside engine control.
    #[error("drift detected during {context}: {detail}")]
    Drift { context: ErrorContext, detail: String },

    /// The caller's cancellation token fired.
    #[error("cancelled during {context}")]
    Cancelled {
        context: ErrorContext,
        last_observed: Option<Box<RemoteState>>,
    },

    /// A replace deleted the old object, then failed to create its successor.
    /// `last_observed` marks the old object as gone.
    #[error("replacement of {old_id} incomplete, old object deleted: {source}")]
    ReplaceIncomplete {
        old_id: String,
        #[source]
        source: Box<EngineError>,
        last_observed: Box<RemoteState>,
    },
}

impl EngineError {
    pub fn validation(kind: impl Into<String>, source: ValidationError) -> Self {
        EngineError::Validation {
            kind: kind.into(),
            source,
        }
    }

    /// Map a failed client call onto the taxonomy.
    pub(crate) fn from_client(context: ErrorContext, source: ClientError) -> Self {
        match source.class {
            ErrorClass::Transient => EngineError::TransientRemote { context, source },
            ErrorClass::NotFound => EngineError::Drift {
                context,
                detail: source.message,
            },
            ErrorClass::PermanentClient | ErrorClass::PermanentServer => {
                EngineError::PermanentRemote { context, source }
            }
        }
    }

    /// Context of a remote-side error, if any.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            EngineError::Validation { .. } | EngineError::Precondition(_) => None,
            EngineError::TransientRemote { context, .. }
            | EngineError::PermanentRemote { context, .. }
            | EngineError::PollTimeout { context, .. }
            | EngineError::Drift { context, .. }
            | EngineError::Cancelled { context, .. } => Some(context),
            EngineError::ReplaceIncomplete { source, .. } => source.context(),
        }
    }

    /// State observed before the engine gave up, for outcomes that are ambiguous.
    ///
    /// A caller should persist this so the next `reconcile` resumes polling
    /// instead of creating a duplicate.
    pub fn last_observed(&self) -> Option<&RemoteState> {
        match self {
            EngineError::PollTimeout { last_observed, .. }
            | EngineError::Cancelled { last_observed, .. } => last_observed.as_deref(),
            EngineError::ReplaceIncomplete { last_observed, .. } => Some(&**last_observed),
            _ => None,
        }
    }

    /// True when re-invoking the same call may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::TransientRemote { .. }
            | EngineError::PollTimeout { .. }
            | EngineError::Cancelled { .. } => true,
            EngineError::ReplaceIncomplete { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// True when no remote call was made.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            EngineError::Validation { .. } | EngineError::Precondition(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
