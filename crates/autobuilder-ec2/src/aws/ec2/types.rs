//! EC2 request and response types
//!
//! Plain data exchanged across the `Ec2Operations` seam, free of SDK types so
//! that the in-memory test double can produce them directly.

use autobuilder_common::InstanceState;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// An EBS volume attached at launch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockDevice {
    pub device_name: String,
    pub size_gib: i32,
    pub volume_type: String,
    /// Provisioned IOPS, only meaningful for io1/io2/gp3
    pub iops: Option<i32>,
    pub encrypted: bool,
}

/// Everything needed to launch one instance
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    /// Availability zone for placement
    pub zone: Option<String>,
    pub security_group_ids: Vec<String>,
    pub keypair_name: Option<String>,
    pub instance_profile_name: Option<String>,
    /// Boot payload in plain text (encoded by the client)
    pub user_data: String,
    pub block_devices: Vec<BlockDevice>,
    /// Applied at launch for on-demand, after fulfilment for spot
    pub tags: Vec<(String, String)>,
}

/// A spot request for a single instance
#[derive(Debug, Clone)]
pub struct SpotRequestSpec {
    pub launch: LaunchSpec,
    /// Maximum hourly price
    pub price: f64,
    pub valid_until: DateTime<Utc>,
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub image_id: Option<String>,
    pub state: InstanceState,
    /// AWS state reason, set when an instance stops or terminates unexpectedly
    pub state_reason: Option<String>,
    pub instance_type: Option<String>,
    pub zone: Option<String>,
    pub subnet_id: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
}

/// Fulfilment status of a spot request
#[derive(Debug, Clone, PartialEq)]
pub enum SpotRequestStatus {
    /// An instance has been launched for the request
    Fulfilled { instance_id: String },
    /// Still being evaluated
    Open { status_code: Option<String> },
    /// Closed, cancelled or failed without (usable) fulfilment
    Rejected {
        status_code: Option<String>,
        /// Instance launched despite the rejection, if any
        instance_id: Option<String>,
    },
}

/// One spot price observation
#[derive(Debug, Clone, PartialEq)]
pub struct SpotPriceSample {
    pub instance_type: String,
    pub zone: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// An elastic (or dynamically assigned) public address
#[derive(Debug, Clone, PartialEq)]
pub struct AddressInfo {
    pub public_ip: String,
    /// Set for elastic IPs, absent for dynamic addresses
    pub allocation_id: Option<String>,
    pub association_id: Option<String>,
    pub instance_id: Option<String>,
}

/// A candidate machine image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub image_id: String,
    pub name: Option<String>,
    /// `<owner>/<name>` image location
    pub location: Option<String>,
    /// ISO 8601 creation date as reported by EC2
    pub creation_date: Option<String>,
}
