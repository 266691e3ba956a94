//! Spot price history and spot instance requests

use super::instance::{
    block_device_mappings, encode_user_data, instance_profile, network_interface,
    parse_instance_type,
};
use super::types::{SpotPriceSample, SpotRequestSpec, SpotRequestStatus};
use super::{Ec2Client, from_chrono, to_chrono};
use anyhow::{Context, Result};
use aws_sdk_ec2::types::{Filter, RequestSpotLaunchSpecification, SpotPlacement};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Request status codes that end a request without an instance
const TERMINAL_FAILURE_CODES: &[&str] = &[
    "bad-parameters",
    "system-error",
    "schedule-expired",
    "canceled-before-fulfillment",
    "constraint-not-fulfillable",
    "limit-exceeded",
    "az-group-constraint",
    "placement-group-constraint",
];

/// Status codes that mean an instance is running for the request
const FULFILLED_CODES: &[&str] = &["fulfilled", "request-canceled-and-instance-running"];

/// Map a spot request's state, status code and instance into a status.
pub(crate) fn spot_request_status(
    state: Option<&str>,
    status_code: Option<&str>,
    instance_id: Option<&str>,
) -> SpotRequestStatus {
    let code = status_code.map(str::to_string);

    if let (Some(code), Some(instance_id)) = (status_code, instance_id) {
        if FULFILLED_CODES.contains(&code) {
            return SpotRequestStatus::Fulfilled {
                instance_id: instance_id.to_string(),
            };
        }
    }

    match state {
        Some("open") if !status_code.is_some_and(|c| TERMINAL_FAILURE_CODES.contains(&c)) => {
            SpotRequestStatus::Open { status_code: code }
        }
        Some("active") => match instance_id {
            Some(id) => SpotRequestStatus::Fulfilled {
                instance_id: id.to_string(),
            },
            None => SpotRequestStatus::Open { status_code: code },
        },
        _ => SpotRequestStatus::Rejected {
            status_code: code,
            instance_id: instance_id.map(str::to_string),
        },
    }
}

impl Ec2Client {
    /// Fetch spot price history for the given types and zones since `since`.
    ///
    /// Follows pagination tokens until the full window is retrieved. Samples
    /// with unparseable prices are dropped.
    pub async fn spot_price_history(
        &self,
        instance_types: &[String],
        zones: &[String],
        product_description: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SpotPriceSample>> {
        let types = instance_types
            .iter()
            .map(|t| parse_instance_type(t))
            .collect::<Result<Vec<_>>>()?;

        let mut samples = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let response = self
                .client
                .describe_spot_price_history()
                .set_instance_types(Some(types.clone()))
                .product_descriptions(product_description)
                .filters(
                    Filter::builder()
                        .name("availability-zone")
                        .set_values(Some(zones.to_vec()))
                        .build(),
                )
                .start_time(from_chrono(since))
                .set_next_token(next_token.take())
                .send()
                .await
                .context("Failed to describe spot price history")?;

            for entry in response.spot_price_history() {
                let (Some(instance_type), Some(zone), Some(price)) = (
                    entry.instance_type(),
                    entry.availability_zone(),
                    entry.spot_price(),
                ) else {
                    continue;
                };
                let Ok(price) = price.parse::<f64>() else {
                    warn!(price = %price, "Ignoring unparseable spot price");
                    continue;
                };
                samples.push(SpotPriceSample {
                    instance_type: instance_type.as_str().to_string(),
                    zone: zone.to_string(),
                    price,
                    timestamp: entry.timestamp().and_then(to_chrono).unwrap_or(since),
                });
            }

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(count = samples.len(), "Fetched spot price history");
        Ok(samples)
    }

    /// Submit a spot request for one instance and return the request id
    pub async fn request_spot_instance(&self, spec: SpotRequestSpec) -> Result<String> {
        let launch = &spec.launch;

        let mut launch_spec = RequestSpotLaunchSpecification::builder()
            .image_id(&launch.image_id)
            .instance_type(parse_instance_type(&launch.instance_type)?)
            .user_data(encode_user_data(&launch.user_data))
            .set_block_device_mappings(Some(block_device_mappings(&launch.block_devices)));

        match &launch.subnet_id {
            Some(subnet) => {
                launch_spec = launch_spec
                    .network_interfaces(network_interface(subnet, &launch.security_group_ids));
            }
            None if !launch.security_group_ids.is_empty() => {
                launch_spec =
                    launch_spec.set_security_group_ids(Some(launch.security_group_ids.clone()));
            }
            None => {}
        }

        if let Some(zone) = &launch.zone {
            launch_spec =
                launch_spec.placement(SpotPlacement::builder().availability_zone(zone).build());
        }

        if let Some(key) = &launch.keypair_name {
            launch_spec = launch_spec.key_name(key);
        }

        if let Some(profile) = &launch.instance_profile_name {
            launch_spec = launch_spec.iam_instance_profile(instance_profile(profile));
        }

        let response = self
            .client
            .request_spot_instances()
            .spot_price(format!("{:.6}", spec.price))
            .instance_count(1)
            .valid_until(from_chrono(spec.valid_until))
            .launch_specification(launch_spec.build())
            .send()
            .await
            .context("Failed to request spot instance")?;

        let request_id = response
            .spot_instance_requests()
            .first()
            .and_then(|r| r.spot_instance_request_id())
            .context("No spot request returned")?
            .to_string();

        info!(
            request_id = %request_id,
            instance_type = %launch.instance_type,
            zone = ?launch.zone,
            price = spec.price,
            "Spot instance requested"
        );
        Ok(request_id)
    }

    /// Current status of a spot request
    pub async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequestStatus> {
        let response = self
            .client
            .describe_spot_instance_requests()
            .spot_instance_request_ids(request_id)
            .send()
            .await
            .with_context(|| format!("Failed to describe spot request {request_id}"))?;

        let request = response
            .spot_instance_requests()
            .first()
            .with_context(|| format!("Spot request {request_id} not found"))?;

        Ok(spot_request_status(
            request.state().map(|s| s.as_str()),
            request.status().and_then(|s| s.code()),
            request.instance_id(),
        ))
    }

    /// Cancel a spot request
    pub async fn cancel_spot_request(&self, request_id: &str) -> Result<()> {
        self.client
            .cancel_spot_instance_requests()
            .spot_instance_request_ids(request_id)
            .send()
            .await
            .with_context(|| format!("Failed to cancel spot request {request_id}"))?;

        debug!(request_id = %request_id, "Cancelled spot request");
        Ok(())
    }
}
