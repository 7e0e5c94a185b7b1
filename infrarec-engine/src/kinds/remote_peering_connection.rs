//! Remote peering connection: links a dynamic routing gateway to a peer
//! in another region.

use std::time::Duration;

use crate::poller::PollConfig;
use crate::schema::{Attribute, AttributeType, ObjectKind, Rule};

pub const KIND: &str = "core_remote_peering_connection";

pub fn remote_peering_connection() -> ObjectKind {
    ObjectKind::builder(KIND)
        .attribute(
            Attribute::immutable("compartment_id", AttributeType::String)
                .required()
                .rule(Rule::NonEmpty),
        )
        .attribute(
            Attribute::immutable("drg_id", AttributeType::String)
                .required()
                .rule(Rule::NonEmpty),
        )
        .attribute(
            Attribute::mutable("display_name", AttributeType::String).rule(Rule::MaxLength(255)),
        )
        .attribute(Attribute::computed("peer_id", AttributeType::String))
        .attribute(Attribute::computed("peer_region_name", AttributeType::String))
        .attribute(Attribute::computed(
            "is_cross_tenancy_peering",
            AttributeType::Bool,
        ))
        .attribute(Attribute::computed("peering_status", AttributeType::String))
        .attribute(Attribute::computed("state", AttributeType::String))
        .attribute(Attribute::computed("time_created", AttributeType::String))
        .pending_states(&["PROVISIONING"])
        .target_states(&["AVAILABLE"])
        .deleting_states(&["TERMINATING"])
        .absent_states(&["TERMINATED"])
        .scope("compartment_id")
        .poll(PollConfig {
            timeout: Duration::from_secs(20 * 60),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        })
        .build()
}
