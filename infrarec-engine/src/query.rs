//! Collection query engine: paginated discovery with client-side filters.

use std::collections::HashSet;

use async_stream::stream;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::client::{Page, RemoteClient, Scope};
use crate::config::EngineConfig;
use crate::error::{ClientError, EngineError, ErrorContext, Operation, Result, ValidationError};
use crate::poller::{Backoff, OperationContext, PollConfig};
use crate::schema::{ObjectKind, Value};
use crate::state::RemoteState;

/// Pseudo-attribute naming the object identifier in filters.
pub const ID_FIELD: &str = "id";

/// Lazy, single-pass sequence of discovered records.
pub type RecordStream<'a> = BoxStream<'a, Result<RemoteState>>;

/// Client-side predicate: the attribute equals any of `values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub attribute: String,
    pub values: Vec<Value>,
}

impl Filter {
    pub fn new(attribute: &str, values: Vec<Value>) -> Self {
        Self {
            attribute: attribute.to_string(),
            values,
        }
    }

    pub fn equals(attribute: &str, value: impl Into<Value>) -> Self {
        Self::new(attribute, vec![value.into()])
    }

    fn matches(&self, kind: &ObjectKind, state: &RemoteState) -> bool {
        let Some(attr) = kind.attribute(&self.attribute) else {
            return self.attribute == ID_FIELD
                && self.values.iter().any(|want| want.as_str() == Some(state.id.as_str()));
        };
        let Some(have) = state.get(&self.attribute) else {
            return false;
        };
        self.values.iter().any(|want| attr.ty.matches(want, have))
    }
}

/// Check scope and filters. Runs before the first list call.
fn check_query(kind: &ObjectKind, scope: &Scope, filters: &[Filter]) -> Result<()> {
    if let Some(required) = kind.scope_attribute() {
        match scope.get(required) {
            Some(v) if !v.trim().is_empty() => {}
            _ => {
                return Err(EngineError::Precondition(format!(
                    "scope parameter '{}' is required to list {}",
                    required,
                    kind.name()
                )));
            }
        }
    }

    for filter in filters {
        if filter.attribute != ID_FIELD && kind.attribute(&filter.attribute).is_none() {
            return Err(EngineError::validation(
                kind.name(),
                ValidationError::UnknownFilterAttribute(filter.attribute.clone()),
            ));
        }
    }

    Ok(())
}

/// List every object of `kind` in `scope` that passes all `filters`.
///
/// Pages are requested one at a time as the stream is consumed. Scope and
/// filter errors are returned before any remote call.
pub fn discover<'a, C>(
    client: &'a C,
    kind: &'a ObjectKind,
    scope: &'a Scope,
    filters: &'a [Filter],
    config: &'a EngineConfig,
    ctx: &'a OperationContext,
) -> Result<RecordStream<'a>>
where
    C: RemoteClient + ?Sized,
{
    check_query(kind, scope, filters)?;

    let poll = config.poll_config_for(kind);
    let attempts = config.list_retry_attempts.max(1);

    let stream = stream! {
        let mut token: Option<String> = None;
        let mut seen: HashSet<String> = HashSet::new();
        let mut page_no: u32 = 0;

        loop {
            page_no += 1;
            let page = match fetch_page(client, kind, scope, token.as_deref(), attempts, &poll, ctx).await {
                Ok(page) => page,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            debug!(kind = kind.name(), page = page_no, records = page.records.len(), "Fetched page");

            for observation in page.records {
                let state = RemoteState::from_observation(kind, observation);
                if filters.iter().all(|f| f.matches(kind, &state)) {
                    yield Ok(state);
                }
            }

            match page.next_page {
                Some(next) if !seen.insert(next.clone()) => {
                    yield Err(EngineError::PermanentRemote {
                        context: ErrorContext::new(kind.name(), Operation::List),
                        source: ClientError::server(format!("pagination token '{}' was already used", next)),
                    });
                    return;
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }
    };

    Ok(Box::pin(stream))
}

/// One list call, retrying transient failures with backoff.
async fn fetch_page<C>(
    client: &C,
    kind: &ObjectKind,
    scope: &Scope,
    token: Option<&str>,
    attempts: u32,
    poll: &PollConfig,
    ctx: &OperationContext,
) -> Result<Page>
where
    C: RemoteClient + ?Sized,
{
    let context = || ErrorContext::new(kind.name(), Operation::List);
    let mut backoff = Backoff::new(poll);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled {
                context: context(),
                last_observed: None,
            });
        }

        match client.list(kind, scope, token).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = backoff.next_delay();
                warn!(kind = kind.name(), attempt, error = %e, "List failed, retrying in {:?}", delay);
                tokio::select! {
                    biased;
                    _ = ctx.cancellation().cancelled() => {
                        return Err(EngineError::Cancelled { context: context(), last_observed: None });
                    }
                    _ = sleep(delay) => {}
                }
            }
            // A missing scope is not drift of any instance.
            Err(e) if e.is_not_found() => {
                return Err(EngineError::PermanentRemote {
                    context: context(),
                    source: e,
                });
            }
            Err(e) => return Err(EngineError::from_client(context(), e)),
        }
    }
}
