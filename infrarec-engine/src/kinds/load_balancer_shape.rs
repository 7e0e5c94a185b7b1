//! Load balancer shapes. Listed for discovery, never managed.

use crate::schema::{Attribute, AttributeType, ObjectKind};

pub const KIND: &str = "load_balancer_shape";

pub fn load_balancer_shape() -> ObjectKind {
    ObjectKind::builder(KIND)
        .attribute(Attribute::computed("compartment_id", AttributeType::String))
        .attribute(Attribute::computed("name", AttributeType::String))
        .scope("compartment_id")
        .discovery_only()
        .build()
}
