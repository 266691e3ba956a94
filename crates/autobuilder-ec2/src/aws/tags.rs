//! Instance tagging
//!
//! Every instance the engine launches carries the worker's configured tags
//! plus the standard `autobuilder:*` tags from `autobuilder_common::tags`.
//! A `Name` tag defaults to the worker name when the configuration does not
//! set one.

use autobuilder_common::tags::{
    TAG_CREATED_AT, TAG_LIFECYCLE, TAG_NAME, TAG_WORKER, format_created_at,
};
use aws_sdk_ec2::types::{ResourceType, Tag, TagSpecification};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Assemble the full tag set for a worker's instance.
///
/// Configured tags win over the defaults except for the `autobuilder:*`
/// keys, which are always set by the engine.
pub fn instance_tags(
    worker: &str,
    lifecycle: &str,
    configured: &BTreeMap<String, String>,
    created_at: DateTime<Utc>,
) -> Vec<(String, String)> {
    let mut tags = configured.clone();
    tags.entry(TAG_NAME.to_string())
        .or_insert_with(|| worker.to_string());
    tags.insert(TAG_WORKER.to_string(), worker.to_string());
    tags.insert(TAG_LIFECYCLE.to_string(), lifecycle.to_string());
    tags.insert(TAG_CREATED_AT.to_string(), format_created_at(created_at));
    tags.into_iter().collect()
}

/// Convert key/value pairs into SDK tags.
pub fn sdk_tags(tags: &[(String, String)]) -> Vec<Tag> {
    tags.iter()
        .map(|(k, v)| Tag::builder().key(k).value(v).build())
        .collect()
}

/// Build an EC2 TagSpecification for a resource type from key/value pairs.
pub fn ec2_tag_spec(resource_type: ResourceType, tags: &[(String, String)]) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource_type)
        .set_tags(Some(sdk_tags(tags)))
        .build()
}
