//! The instance currently backing a latent worker

use super::spec::Placement;
use autobuilder_common::InstanceState;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Spot request details for an instance obtained by bidding
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotFulfilment {
    pub request_id: String,
    pub bid: f64,
    pub fulfilled_at: DateTime<Utc>,
}

/// A provisioned instance, owned by its worker's controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceHandle {
    pub instance_id: String,
    pub image_id: String,
    pub state: InstanceState,
    pub placement: Placement,
    pub launch_time: Option<DateTime<Utc>>,
    pub spot: Option<SpotFulfilment>,
    /// Association id of the configured elastic IP
    pub elastic_ip_association: Option<String>,
}

impl InstanceHandle {
    pub fn is_spot(&self) -> bool {
        self.spot.is_some()
    }
}
