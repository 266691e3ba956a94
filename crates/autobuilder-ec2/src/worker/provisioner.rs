//! Instance provisioning strategies
//!
//! `FixedInstanceProvisioner` launches one on-demand instance of a fixed
//! type; `SpotInstanceProvisioner` hands the worker's candidate types and
//! zones to the spot bidder. The controller picks one through `Provisioner`
//! based on the worker's sizing.

use super::handle::{InstanceHandle, SpotFulfilment};
use super::instance::wait_until_running;
use super::spec::{ImageSelector, InstanceSizing, LatentWorkerSpec, Placement};
use crate::aws::ec2::Ec2Operations;
use crate::aws::tags::instance_tags;
use crate::error::WorkerError;
use crate::spot::{SpotBidder, SpotOffer, SpotZone};
use autobuilder_common::InstanceState;
use autobuilder_common::tags::lifecycle;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// One substantiation attempt for one worker
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest<'a> {
    pub worker: &'a str,
    pub spec: &'a LatentWorkerSpec,
    pub image_id: &'a str,
}

/// Strategy for obtaining a running instance
pub trait InstanceProvisioner: Send + Sync {
    fn provision(
        &self,
        request: ProvisionRequest<'_>,
    ) -> impl Future<Output = Result<InstanceHandle, WorkerError>> + Send;
}

fn launch_failed(worker: &str) -> impl FnOnce(anyhow::Error) -> WorkerError + '_ {
    move |source| WorkerError::LaunchFailed {
        worker: worker.to_string(),
        source,
    }
}

fn config_error(worker: &str, message: impl Into<String>) -> WorkerError {
    WorkerError::Config {
        worker: worker.to_string(),
        message: message.into(),
    }
}

/// Resolve the image to launch
pub async fn resolve_image<E: Ec2Operations>(
    ec2: &E,
    worker: &str,
    image: &ImageSelector,
) -> Result<String, WorkerError> {
    if let ImageSelector::Id(id) = image {
        return Ok(id.clone());
    }

    let images = ec2
        .list_images(&image.owners())
        .await
        .map_err(launch_failed(worker))?;

    let chosen = image
        .pick(&images)
        .ok_or_else(|| config_error(worker, "no available AMI matches the configured owners/regex"))?;

    debug!(worker = %worker, image_id = %chosen.image_id, location = ?chosen.location, "Resolved AMI");
    Ok(chosen.image_id.clone())
}

/// Launches a single on-demand instance
pub struct FixedInstanceProvisioner<E> {
    ec2: Arc<E>,
}

impl<E: Ec2Operations> FixedInstanceProvisioner<E> {
    pub fn new(ec2: Arc<E>) -> Self {
        Self { ec2 }
    }
}

impl<E: Ec2Operations> InstanceProvisioner for FixedInstanceProvisioner<E> {
    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<InstanceHandle, WorkerError> {
        let ProvisionRequest {
            worker,
            spec,
            image_id,
        } = request;
        let InstanceSizing::Fixed {
            instance_type,
            subnet_id,
            zone,
        } = &spec.sizing
        else {
            return Err(config_error(worker, "fixed provisioner used for a spot worker"));
        };

        let zone = match (zone, subnet_id) {
            (Some(zone), _) => Some(zone.clone()),
            (None, Some(subnet)) => Some(
                self.ec2
                    .subnet_zone(subnet)
                    .await
                    .map_err(launch_failed(worker))?,
            ),
            (None, None) => None,
        };
        let placement = Placement {
            instance_type: instance_type.clone(),
            zone,
            subnet_id: subnet_id.clone(),
        };

        let tags = instance_tags(worker, lifecycle::ON_DEMAND, &spec.tags, Utc::now());
        let instance_id = self
            .ec2
            .launch_instance(spec.launch_spec(image_id, &placement, tags))
            .await
            .map_err(launch_failed(worker))?;
        info!(worker = %worker, instance_id = %instance_id, "Launched on-demand instance");

        let snapshot =
            wait_until_running(self.ec2.as_ref(), worker, &instance_id, spec.timeouts.ready)
                .await?;

        Ok(InstanceHandle {
            instance_id,
            image_id: snapshot.image_id.unwrap_or_else(|| image_id.to_string()),
            state: InstanceState::Running,
            placement: Placement {
                zone: snapshot.zone.or(placement.zone),
                ..placement
            },
            launch_time: snapshot.launch_time,
            spot: None,
            elastic_ip_association: None,
        })
    }
}

/// Obtains an instance through the spot bidder
pub struct SpotInstanceProvisioner<E> {
    ec2: Arc<E>,
    bidder: SpotBidder<E>,
}

impl<E: Ec2Operations> SpotInstanceProvisioner<E> {
    pub fn new(ec2: Arc<E>) -> Self {
        Self {
            bidder: SpotBidder::new(ec2.clone()),
            ec2,
        }
    }

    /// Build the offer for a spot worker: resolve subnet zones and the launch template.
    pub async fn offer(&self, request: ProvisionRequest<'_>) -> Result<SpotOffer, WorkerError> {
        let ProvisionRequest {
            worker,
            spec,
            image_id,
        } = request;
        let InstanceSizing::Spot {
            instance_types,
            subnet_ids,
            zone,
            pricing,
            product_description,
        } = &spec.sizing
        else {
            return Err(config_error(worker, "spot provisioner used for an on-demand worker"));
        };

        let zones = if subnet_ids.is_empty() {
            let zone = zone
                .clone()
                .ok_or_else(|| config_error(worker, "spot worker needs subnet_ids or placement"))?;
            vec![SpotZone {
                zone,
                subnet_id: None,
            }]
        } else {
            let mut zones = Vec::with_capacity(subnet_ids.len());
            for subnet in subnet_ids {
                let zone = self
                    .ec2
                    .subnet_zone(subnet)
                    .await
                    .map_err(launch_failed(worker))?;
                zones.push(SpotZone {
                    zone,
                    subnet_id: Some(subnet.clone()),
                });
            }
            zones
        };

        let template_placement = Placement {
            instance_type: String::new(),
            zone: None,
            subnet_id: None,
        };
        let tags = instance_tags(worker, lifecycle::SPOT, &spec.tags, Utc::now());

        Ok(SpotOffer {
            instance_types: instance_types.clone(),
            zones,
            pricing: *pricing,
            product_description: product_description.clone(),
            template: spec.launch_spec(image_id, &template_placement, tags),
            ready_timeout: spec.timeouts.ready,
        })
    }

    pub fn bidder(&self) -> &SpotBidder<E> {
        &self.bidder
    }
}

impl<E: Ec2Operations> InstanceProvisioner for SpotInstanceProvisioner<E> {
    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<InstanceHandle, WorkerError> {
        let offer = self.offer(request).await?;
        let outcome = self.bidder.request_spot(request.worker, &offer).await?;

        Ok(InstanceHandle {
            instance_id: outcome.instance_id,
            image_id: outcome.image_id,
            state: InstanceState::Running,
            placement: Placement {
                instance_type: outcome.instance_type,
                zone: Some(outcome.zone),
                subnet_id: outcome.subnet_id,
            },
            launch_time: outcome.launch_time,
            spot: Some(SpotFulfilment {
                request_id: outcome.request_id,
                bid: outcome.bid,
                fulfilled_at: outcome.fulfilled_at,
            }),
            elastic_ip_association: None,
        })
    }
}

/// Provisioning strategy selected by a worker's sizing
pub enum Provisioner<E> {
    Fixed(FixedInstanceProvisioner<E>),
    Spot(SpotInstanceProvisioner<E>),
}

impl<E: Ec2Operations> Provisioner<E> {
    pub fn for_spec(ec2: Arc<E>, spec: &LatentWorkerSpec) -> Self {
        match spec.sizing {
            InstanceSizing::Fixed { .. } => Provisioner::Fixed(FixedInstanceProvisioner::new(ec2)),
            InstanceSizing::Spot { .. } => Provisioner::Spot(SpotInstanceProvisioner::new(ec2)),
        }
    }
}

impl<E: Ec2Operations> InstanceProvisioner for Provisioner<E> {
    async fn provision(&self, request: ProvisionRequest<'_>) -> Result<InstanceHandle, WorkerError> {
        match self {
            Provisioner::Fixed(p) => p.provision(request).await,
            Provisioner::Spot(p) => p.provision(request).await,
        }
    }
}
