//! Elastic IP lookup and association

use super::Ec2Client;
use super::types::AddressInfo;
use crate::aws::error::classify_anyhow_error;
use anyhow::{Context, Result};
use aws_sdk_ec2::types::{Address, Filter};
use tracing::{debug, info};

fn address_info(address: &Address) -> Option<AddressInfo> {
    Some(AddressInfo {
        public_ip: address.public_ip()?.to_string(),
        allocation_id: address.allocation_id().map(str::to_string),
        association_id: address.association_id().map(str::to_string),
        instance_id: address.instance_id().map(str::to_string),
    })
}

impl Ec2Client {
    /// Look up an elastic IP by public address.
    ///
    /// Returns `None` if the address is not allocated to this account.
    pub async fn find_elastic_ip(&self, public_ip: &str) -> Result<Option<AddressInfo>> {
        match self
            .client
            .describe_addresses()
            .public_ips(public_ip)
            .send()
            .await
        {
            Ok(resp) => Ok(resp.addresses().iter().find_map(address_info)),
            Err(e) => {
                let err = anyhow::Error::from(e);
                if classify_anyhow_error(&err).is_not_found() {
                    Ok(None)
                } else {
                    Err(err.context(format!("Failed to describe address {public_ip}")))
                }
            }
        }
    }

    /// Addresses associated with an instance
    pub async fn addresses_for_instance(&self, instance_id: &str) -> Result<Vec<AddressInfo>> {
        let response = self
            .client
            .describe_addresses()
            .filters(
                Filter::builder()
                    .name("instance-id")
                    .values(instance_id)
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("Failed to describe addresses of {instance_id}"))?;

        Ok(response
            .addresses()
            .iter()
            .filter_map(address_info)
            .collect())
    }

    /// Associate an elastic IP allocation with an instance
    pub async fn associate_address(&self, allocation_id: &str, instance_id: &str) -> Result<String> {
        let response = self
            .client
            .associate_address()
            .allocation_id(allocation_id)
            .instance_id(instance_id)
            .send()
            .await
            .with_context(|| format!("Failed to associate {allocation_id} with {instance_id}"))?;

        let association_id = response
            .association_id()
            .context("No association id returned")?
            .to_string();

        info!(
            allocation_id = %allocation_id,
            instance_id = %instance_id,
            association_id = %association_id,
            "Associated elastic IP"
        );
        Ok(association_id)
    }

    /// Remove an address association
    pub async fn disassociate_address(&self, association_id: &str) -> Result<()> {
        self.client
            .disassociate_address()
            .association_id(association_id)
            .send()
            .await
            .with_context(|| format!("Failed to disassociate {association_id}"))?;

        debug!(association_id = %association_id, "Disassociated address");
        Ok(())
    }
}
