//! EC2 operations trait
//!
//! The engine talks to EC2 exclusively through this trait. `Ec2Client`
//! implements it over `aws-sdk-ec2`; unit tests use an in-memory fake.

use super::Ec2Client;
use super::types::{
    AddressInfo, ImageInfo, InstanceSnapshot, LaunchSpec, SpotPriceSample, SpotRequestSpec,
    SpotRequestStatus,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::future::Future;

/// EC2 operations used by the latent-worker engine.
pub trait Ec2Operations: Send + Sync {
    /// List available images owned by any of `owners`
    fn list_images(&self, owners: &[String]) -> impl Future<Output = Result<Vec<ImageInfo>>> + Send;

    /// Availability zone of a subnet
    fn subnet_zone(&self, subnet_id: &str) -> impl Future<Output = Result<String>> + Send;

    /// Launch one on-demand instance, returning its id
    fn launch_instance(&self, spec: LaunchSpec) -> impl Future<Output = Result<String>> + Send;

    /// Describe an instance; `None` if EC2 no longer knows it
    fn describe_instance(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = Result<Option<InstanceSnapshot>>> + Send;

    /// Request termination of an instance
    fn terminate_instance(&self, instance_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Apply tags to an existing instance
    fn tag_instance(
        &self,
        instance_id: &str,
        tags: &[(String, String)],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Spot price history since `since` for the given types and zones
    fn spot_price_history(
        &self,
        instance_types: &[String],
        zones: &[String],
        product_description: &str,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<SpotPriceSample>>> + Send;

    /// Submit a one-instance spot request, returning the request id
    fn request_spot_instance(
        &self,
        spec: SpotRequestSpec,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Current status of a spot request
    fn describe_spot_request(
        &self,
        request_id: &str,
    ) -> impl Future<Output = Result<SpotRequestStatus>> + Send;

    /// Cancel a spot request (instances it launched are not affected)
    fn cancel_spot_request(&self, request_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Look up an elastic IP by its public address
    fn find_elastic_ip(
        &self,
        public_ip: &str,
    ) -> impl Future<Output = Result<Option<AddressInfo>>> + Send;

    /// Addresses currently associated with an instance
    fn addresses_for_instance(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = Result<Vec<AddressInfo>>> + Send;

    /// Associate an elastic IP allocation with an instance, returning the association id
    fn associate_address(
        &self,
        allocation_id: &str,
        instance_id: &str,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Remove an address association
    fn disassociate_address(
        &self,
        association_id: &str,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl Ec2Operations for Ec2Client {
    async fn list_images(&self, owners: &[String]) -> Result<Vec<ImageInfo>> {
        Ec2Client::list_images(self, owners).await
    }

    async fn subnet_zone(&self, subnet_id: &str) -> Result<String> {
        Ec2Client::subnet_zone(self, subnet_id).await
    }

    async fn launch_instance(&self, spec: LaunchSpec) -> Result<String> {
        Ec2Client::launch_instance(self, spec).await
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<Option<InstanceSnapshot>> {
        Ec2Client::describe_instance(self, instance_id).await
    }

    async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        Ec2Client::terminate_instance(self, instance_id).await
    }

    async fn tag_instance(&self, instance_id: &str, tags: &[(String, String)]) -> Result<()> {
        Ec2Client::tag_instance(self, instance_id, tags).await
    }

    async fn spot_price_history(
        &self,
        instance_types: &[String],
        zones: &[String],
        product_description: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<SpotPriceSample>> {
        Ec2Client::spot_price_history(self, instance_types, zones, product_description, since)
            .await
    }

    async fn request_spot_instance(&self, spec: SpotRequestSpec) -> Result<String> {
        Ec2Client::request_spot_instance(self, spec).await
    }

    async fn describe_spot_request(&self, request_id: &str) -> Result<SpotRequestStatus> {
        Ec2Client::describe_spot_request(self, request_id).await
    }

    async fn cancel_spot_request(&self, request_id: &str) -> Result<()> {
        Ec2Client::cancel_spot_request(self, request_id).await
    }

    async fn find_elastic_ip(&self, public_ip: &str) -> Result<Option<AddressInfo>> {
        Ec2Client::find_elastic_ip(self, public_ip).await
    }

    async fn addresses_for_instance(&self, instance_id: &str) -> Result<Vec<AddressInfo>> {
        Ec2Client::addresses_for_instance(self, instance_id).await
    }

    async fn associate_address(&self, allocation_id: &str, instance_id: &str) -> Result<String> {
        Ec2Client::associate_address(self, allocation_id, instance_id).await
    }

    async fn disassociate_address(&self, association_id: &str) -> Result<()> {
        Ec2Client::disassociate_address(self, association_id).await
    }
}
