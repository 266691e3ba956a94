//! EC2 instance lifecycle operations

use super::types::{BlockDevice, InstanceSnapshot, LaunchSpec};
use super::{Ec2Client, to_chrono};
use crate::aws::error::{AwsError, classify_anyhow_error};
use crate::aws::tags::{ec2_tag_spec, sdk_tags};
use anyhow::{Context, Result};
use autobuilder_common::InstanceState;
use aws_sdk_ec2::types::{
    BlockDeviceMapping, EbsBlockDevice, IamInstanceProfileSpecification,
    InstanceNetworkInterfaceSpecification, InstanceType, Placement, ResourceType, VolumeType,
};
use backon::{ExponentialBuilder, Retryable};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Check if an error is retryable (IAM propagation delay or throttling)
fn is_retryable_launch_error(e: &anyhow::Error) -> bool {
    classify_anyhow_error(e).is_retryable()
}

/// Base64-encode the boot payload as EC2 expects it
pub(super) fn encode_user_data(user_data: &str) -> String {
    base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        user_data.as_bytes(),
    )
}

/// Parse an instance type string into the SDK enum
pub(super) fn parse_instance_type(instance_type: &str) -> Result<InstanceType> {
    instance_type
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid instance type: {instance_type}"))
}

/// Block-device mappings for the configured volumes
pub(super) fn block_device_mappings(devices: &[BlockDevice]) -> Vec<BlockDeviceMapping> {
    devices
        .iter()
        .map(|d| {
            BlockDeviceMapping::builder()
                .device_name(&d.device_name)
                .ebs(
                    EbsBlockDevice::builder()
                        .volume_size(d.size_gib)
                        .volume_type(VolumeType::from(d.volume_type.as_str()))
                        .set_iops(d.iops)
                        .encrypted(d.encrypted)
                        .delete_on_termination(true)
                        .build(),
                )
                .build()
        })
        .collect()
}

/// Primary network interface with a public address in the given subnet
pub(super) fn network_interface(
    subnet_id: &str,
    security_group_ids: &[String],
) -> InstanceNetworkInterfaceSpecification {
    InstanceNetworkInterfaceSpecification::builder()
        .associate_public_ip_address(true)
        .device_index(0)
        .subnet_id(subnet_id)
        .set_groups((!security_group_ids.is_empty()).then(|| security_group_ids.to_vec()))
        .build()
}

/// IAM instance profile by name
pub(super) fn instance_profile(name: &str) -> IamInstanceProfileSpecification {
    IamInstanceProfileSpecification::builder().name(name).build()
}

impl Ec2Client {
    /// Launch an on-demand instance and return its id.
    ///
    /// Retries on transient errors including:
    /// - IAM eventual consistency (profile not yet visible to EC2)
    /// - AWS rate limiting (throttling)
    pub async fn launch_instance(&self, spec: LaunchSpec) -> Result<String> {
        info!(
            instance_type = %spec.instance_type,
            image_id = %spec.image_id,
            zone = ?spec.zone,
            subnet_id = ?spec.subnet_id,
            "Launching instance"
        );

        let instance_type = spec.instance_type.clone();

        (|| async { self.do_launch_instance(&spec).await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_secs(2))
                    .with_max_delay(Duration::from_secs(30))
                    .with_max_times(8),
            )
            .when(is_retryable_launch_error)
            .notify(|e, dur| match classify_anyhow_error(e) {
                AwsError::IamPropagationDelay => {
                    warn!(
                        delay = ?dur,
                        instance_type = %instance_type,
                        error = %e,
                        "IAM instance profile not yet visible to EC2, retrying..."
                    );
                }
                _ => {
                    warn!(
                        delay = ?dur,
                        instance_type = %instance_type,
                        error = %e,
                        "AWS rate limited, backing off..."
                    );
                }
            })
            .await
    }

    /// Perform the actual RunInstances call
    async fn do_launch_instance(&self, spec: &LaunchSpec) -> Result<String> {
        let mut request = self
            .client
            .run_instances()
            .image_id(&spec.image_id)
            .instance_type(parse_instance_type(&spec.instance_type)?)
            .min_count(1)
            .max_count(1)
            .user_data(encode_user_data(&spec.user_data))
            .set_block_device_mappings(Some(block_device_mappings(&spec.block_devices)))
            .tag_specifications(ec2_tag_spec(ResourceType::Instance, &spec.tags));

        match &spec.subnet_id {
            Some(subnet) => {
                request = request.network_interfaces(network_interface(subnet, &spec.security_group_ids));
            }
            None if !spec.security_group_ids.is_empty() => {
                request = request.set_security_group_ids(Some(spec.security_group_ids.clone()));
            }
            None => {}
        }

        if let Some(zone) = &spec.zone {
            request = request.placement(Placement::builder().availability_zone(zone).build());
        }

        if let Some(key) = &spec.keypair_name {
            request = request.key_name(key);
        }

        if let Some(profile) = &spec.instance_profile_name {
            request = request.iam_instance_profile(instance_profile(profile));
        }

        let response = request.send().await.context("Failed to launch instance")?;

        let instance_id = response
            .instances()
            .first()
            .and_then(|i| i.instance_id())
            .context("No instance returned")?
            .to_string();

        info!(instance_id = %instance_id, "Instance launched");
        Ok(instance_id)
    }

    /// Describe an instance. Returns `None` when EC2 reports it as unknown.
    pub async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>> {
        let response = match self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                let err = anyhow::Error::from(e);
                if classify_anyhow_error(&err).is_not_found() {
                    debug!(instance_id = %instance_id, "Instance not found");
                    return Ok(None);
                }
                return Err(err.context(format!("Failed to describe instance {instance_id}")));
            }
        };

        let Some(instance) = response
            .reservations()
            .first()
            .and_then(|r| r.instances().first())
        else {
            return Ok(None);
        };

        let state = instance
            .state()
            .and_then(|s| s.name())
            .and_then(|name| InstanceState::parse(name.as_str()))
            .unwrap_or_default();

        Ok(Some(InstanceSnapshot {
            instance_id: instance_id.to_string(),
            image_id: instance.image_id().map(str::to_string),
            state,
            state_reason: instance
                .state_reason()
                .and_then(|r| r.message())
                .map(str::to_string),
            instance_type: instance.instance_type().map(|t| t.as_str().to_string()),
            zone: instance
                .placement()
                .and_then(|p| p.availability_zone())
                .map(str::to_string),
            subnet_id: instance.subnet_id().map(str::to_string),
            launch_time: instance.launch_time().and_then(to_chrono),
        }))
    }

    /// Terminate an instance
    pub async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        info!(instance_id = %instance_id, "Terminating instance");

        self.client
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .context("Failed to terminate instance")?;

        Ok(())
    }

    /// Apply tags to an instance
    pub async fn tag_instance(&self, instance_id: &str, tags: &[(String, String)]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }

        self.client
            .create_tags()
            .resources(instance_id)
            .set_tags(Some(sdk_tags(tags)))
            .send()
            .await
            .with_context(|| format!("Failed to tag instance {instance_id}"))?;

        debug!(instance_id = %instance_id, count = tags.len(), "Tagged instance");
        Ok(())
    }
}
