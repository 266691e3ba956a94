//! Latent worker definitions
//!
//! A `LatentWorkerSpec` is built once from the farm configuration and never
//! changes afterwards. The sizing form (fixed on-demand vs. spot) is an enum,
//! so a worker cannot be both.

use crate::aws::ec2::{BlockDevice, ImageInfo, LaunchSpec};
use crate::spot::SpotPricing;
use regex::Regex;
use std::collections::BTreeMap;
use std::time::Duration;

/// How the machine image is chosen
#[derive(Debug, Clone)]
pub enum ImageSelector {
    /// A fixed AMI id
    Id(String),
    /// Newest available image from `owners` whose location matches `name_regex`
    Lookup {
        owners: Vec<String>,
        name_regex: Option<Regex>,
    },
}

impl ImageSelector {
    /// Owners to query; an empty list means images owned by this account
    pub fn owners(&self) -> Vec<String> {
        match self {
            ImageSelector::Id(_) => Vec::new(),
            ImageSelector::Lookup { owners, .. } if owners.is_empty() => vec!["self".to_string()],
            ImageSelector::Lookup { owners, .. } => owners.clone(),
        }
    }

    /// Pick the newest matching image from a listing.
    ///
    /// The regex is matched against the image location, falling back to the
    /// name. Ties on creation date are broken by location.
    pub fn pick<'a>(&self, images: &'a [ImageInfo]) -> Option<&'a ImageInfo> {
        let ImageSelector::Lookup { name_regex, .. } = self else {
            return None;
        };

        images
            .iter()
            .filter(|img| match name_regex {
                Some(re) => img
                    .location
                    .as_deref()
                    .or(img.name.as_deref())
                    .is_some_and(|s| re.is_match(s)),
                None => true,
            })
            .max_by(|a, b| {
                a.creation_date
                    .cmp(&b.creation_date)
                    .then_with(|| a.location.cmp(&b.location))
            })
    }
}

/// Instance sizing: exactly one of fixed on-demand or spot
#[derive(Debug, Clone)]
pub enum InstanceSizing {
    /// One on-demand instance of a fixed type
    Fixed {
        instance_type: String,
        subnet_id: Option<String>,
        /// Availability zone (region + placement letter)
        zone: Option<String>,
    },
    /// Bid for spot capacity across types and subnets
    Spot {
        instance_types: Vec<String>,
        subnet_ids: Vec<String>,
        /// Zone used when no subnets are configured
        zone: Option<String>,
        pricing: SpotPricing,
        product_description: String,
    },
}

impl InstanceSizing {
    pub fn is_spot(&self) -> bool {
        matches!(self, InstanceSizing::Spot { .. })
    }
}

/// Quarantine escalation bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantinePolicy {
    pub initial: Duration,
    pub max: Duration,
}

/// Per-worker timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimeouts {
    /// Idle time after the last build before the instance is released
    pub build_wait: Duration,
    /// Maximum time for a launched instance to reach `running`
    pub ready: Duration,
    /// Maximum time for the worker to connect once its instance is running
    pub missing: Duration,
}

/// Where an instance actually landed
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Placement {
    pub instance_type: String,
    pub zone: Option<String>,
    pub subnet_id: Option<String>,
}

/// Everything needed to provision and tear down a latent worker's instance
#[derive(Debug, Clone)]
pub struct LatentWorkerSpec {
    pub image: ImageSelector,
    pub sizing: InstanceSizing,
    pub security_group_ids: Vec<String>,
    pub keypair_name: Option<String>,
    pub instance_profile_name: Option<String>,
    /// Rendered boot payload
    pub user_data: String,
    pub block_devices: Vec<BlockDevice>,
    /// Public address of an elastic IP to associate once running
    pub elastic_ip: Option<String>,
    /// Also drop every other address association at teardown
    pub disassociate_dynamic_addresses: bool,
    pub tags: BTreeMap<String, String>,
    pub timeouts: WorkerTimeouts,
    pub quarantine: QuarantinePolicy,
}

impl LatentWorkerSpec {
    /// Launch parameters for one placement of this worker
    pub fn launch_spec(
        &self,
        image_id: &str,
        placement: &Placement,
        tags: Vec<(String, String)>,
    ) -> LaunchSpec {
        LaunchSpec {
            image_id: image_id.to_string(),
            instance_type: placement.instance_type.clone(),
            subnet_id: placement.subnet_id.clone(),
            zone: placement.zone.clone(),
            security_group_ids: self.security_group_ids.clone(),
            keypair_name: self.keypair_name.clone(),
            instance_profile_name: self.instance_profile_name.clone(),
            user_data: self.user_data.clone(),
            block_devices: self.block_devices.clone(),
            tags,
        }
    }
}
