//! Account role granting policies to member logins.
//!
//! The role API reports no lifecycle state; clients report `ACTIVE` for
//! every role they can read.

use std::time::Duration;

use crate::poller::PollConfig;
use crate::schema::{Attribute, AttributeType, ObjectKind, Rule};

pub const KIND: &str = "identity_role";

pub fn identity_role() -> ObjectKind {
    ObjectKind::builder(KIND)
        .attribute(
            Attribute::mutable("name", AttributeType::String)
                .required()
                .rule(Rule::NonEmpty),
        )
        .attribute(Attribute::mutable("policies", AttributeType::StringSet))
        .attribute(Attribute::mutable("members", AttributeType::StringSet))
        .attribute(Attribute::mutable(
            "default_members",
            AttributeType::StringSet,
        ))
        .target_states(&["ACTIVE"])
        .poll(PollConfig {
            timeout: Duration::from_secs(5 * 60),
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
        })
        .build()
}
