//! EC2 instance, spot and address management

mod address;
mod instance;
mod operations;
mod spot;
mod types;

pub use operations::Ec2Operations;
pub use types::{
    AddressInfo, BlockDevice, ImageInfo, InstanceSnapshot, LaunchSpec, SpotPriceSample,
    SpotRequestSpec, SpotRequestStatus,
};

use crate::aws::context::AwsContext;
use anyhow::{Context, Result};
use aws_sdk_ec2::{Client, types::Filter};
use tracing::debug;

/// EC2 client for managing latent-worker instances
pub struct Ec2Client {
    pub(crate) client: Client,
}

impl Ec2Client {
    /// Create a new EC2 client (loads AWS config from environment)
    pub async fn new(region: &str, profile: Option<&str>) -> Result<Self> {
        let ctx = AwsContext::new(region, profile).await;
        Ok(Self::from_context(&ctx))
    }

    /// Create an EC2 client from a pre-loaded AWS context
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.ec2_client(),
        }
    }

    /// List available images owned by any of the given owners
    pub async fn list_images(&self, owners: &[String]) -> Result<Vec<ImageInfo>> {
        let response = self
            .client
            .describe_images()
            .set_owners(Some(owners.to_vec()))
            .filters(Filter::builder().name("state").values("available").build())
            .send()
            .await
            .context("Failed to describe images")?;

        let images: Vec<ImageInfo> = response
            .images()
            .iter()
            .filter_map(|img| {
                Some(ImageInfo {
                    image_id: img.image_id()?.to_string(),
                    name: img.name().map(str::to_string),
                    location: img.image_location().map(str::to_string),
                    creation_date: img.creation_date().map(str::to_string),
                })
            })
            .collect();

        debug!(owners = ?owners, count = images.len(), "Listed images");
        Ok(images)
    }

    /// Look up the availability zone of a subnet
    pub async fn subnet_zone(&self, subnet_id: &str) -> Result<String> {
        let response = self
            .client
            .describe_subnets()
            .subnet_ids(subnet_id)
            .send()
            .await
            .with_context(|| format!("Failed to describe subnet {subnet_id}"))?;

        let zone = response
            .subnets()
            .first()
            .and_then(|s| s.availability_zone())
            .with_context(|| format!("Subnet {subnet_id} has no availability zone"))?;

        debug!(subnet_id = %subnet_id, zone = %zone, "Resolved subnet zone");
        Ok(zone.to_string())
    }
}

/// Convert an SDK timestamp to chrono
pub(crate) fn to_chrono(t: &aws_sdk_ec2::primitives::DateTime) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos())
}

/// Convert a chrono timestamp to the SDK type
pub(crate) fn from_chrono(t: chrono::DateTime<chrono::Utc>) -> aws_sdk_ec2::primitives::DateTime {
    aws_sdk_ec2::primitives::DateTime::from_secs(t.timestamp())
}
