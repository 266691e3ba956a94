//! Spot request loop
//!
//! Requests one instance per (instance type, zone) pair, cheapest bid first,
//! until a request is fulfilled. Every request that does not produce the
//! returned instance is cancelled, and any instance it launched late is
//! terminated, so nothing is left running unclaimed.

use super::bid::{Bid, BidTable, SpotPricing, SpotZone, candidate_pairs, compute_bids};
use crate::aws::ec2::{Ec2Operations, LaunchSpec, SpotRequestSpec, SpotRequestStatus};
use crate::aws::error::ignore_not_found;
use crate::error::WorkerError;
use crate::wait::{WaitConfig, wait_for_resource};
use crate::worker::instance::{terminate, wait_until_running};
use autobuilder_common::defaults::{
    SPOT_FULFILLMENT_MAX_ATTEMPTS, SPOT_FULFILLMENT_POLL_INTERVAL, SPOT_PRICE_HISTORY_WINDOW,
    SPOT_REQUEST_VALID_FOR,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Reason reported when every candidate pair has been tried
pub const EXHAUSTED_REASON: &str = "exhausted instance types";

/// What a spot worker is willing to run on and pay
#[derive(Debug, Clone)]
pub struct SpotOffer {
    pub instance_types: Vec<String>,
    pub zones: Vec<SpotZone>,
    pub pricing: SpotPricing,
    pub product_description: String,
    /// Launch parameters; type, zone and subnet are filled in per pair
    pub template: LaunchSpec,
    pub ready_timeout: Duration,
}

/// A fulfilled and running spot instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotOutcome {
    pub instance_id: String,
    pub image_id: String,
    pub launch_time: Option<DateTime<Utc>>,
    pub request_id: String,
    pub bid: f64,
    pub instance_type: String,
    pub zone: String,
    pub subnet_id: Option<String>,
    pub fulfilled_at: DateTime<Utc>,
}

/// Outcome of the fulfilment wait for one request
enum Fulfilment {
    Fulfilled(String),
    Rejected(Option<String>),
}

/// Bids for spot capacity through an `Ec2Operations` implementation
pub struct SpotBidder<E> {
    ec2: Arc<E>,
}

impl<E: Ec2Operations> SpotBidder<E> {
    pub fn new(ec2: Arc<E>) -> Self {
        Self { ec2 }
    }

    /// Compute the ordered bid table for an offer.
    ///
    /// Price history is only fetched when the pricing policy needs it.
    pub async fn bid_table(&self, offer: &SpotOffer) -> anyhow::Result<BidTable> {
        let pairs = candidate_pairs(&offer.instance_types, &offer.zones);

        let history = if offer.pricing.needs_history() {
            let since = Utc::now()
                - chrono::Duration::from_std(SPOT_PRICE_HISTORY_WINDOW)
                    .unwrap_or(chrono::Duration::hours(24));
            let zones: Vec<String> = offer.zones.iter().map(|z| z.zone.clone()).collect();
            self.ec2
                .spot_price_history(
                    &offer.instance_types,
                    &zones,
                    &offer.product_description,
                    since,
                )
                .await?
        } else {
            Vec::new()
        };

        Ok(compute_bids(pairs, &offer.pricing, &history))
    }

    /// Obtain one running spot instance for `worker`.
    pub async fn request_spot(
        &self,
        worker: &str,
        offer: &SpotOffer,
    ) -> Result<SpotOutcome, WorkerError> {
        let table = self
            .bid_table(offer)
            .await
            .map_err(|source| WorkerError::LaunchFailed {
                worker: worker.to_string(),
                source,
            })?;

        for pair in &table.skipped {
            info!(worker = %worker, pair = %pair, "No spot price history, not bidding");
        }

        for bid in &table.bids {
            info!(
                worker = %worker,
                instance_type = %bid.pair.instance_type,
                zone = %bid.pair.zone,
                price = format_args!("{:.4}", bid.price),
                "Requesting spot instance"
            );
            if let Some(outcome) = self.try_bid(worker, offer, bid).await? {
                return Ok(outcome);
            }
        }

        Err(WorkerError::SpotExhausted {
            worker: worker.to_string(),
            reason: EXHAUSTED_REASON.to_string(),
        })
    }

    /// Submit one request and wait for it.
    ///
    /// `Ok(None)` means move on to the next pair. An instance that is
    /// fulfilled but then fails to start is an error for the whole attempt.
    async fn try_bid(
        &self,
        worker: &str,
        offer: &SpotOffer,
        bid: &Bid,
    ) -> Result<Option<SpotOutcome>, WorkerError> {
        let mut launch = offer.template.clone();
        launch.instance_type = bid.pair.instance_type.clone();
        launch.zone = Some(bid.pair.zone.clone());
        launch.subnet_id = bid.pair.subnet_id.clone();
        let tags = std::mem::take(&mut launch.tags);
        let image_id = launch.image_id.clone();

        let valid_until = Utc::now()
            + chrono::Duration::from_std(SPOT_REQUEST_VALID_FOR)
                .unwrap_or(chrono::Duration::seconds(60));

        let request_id = match self
            .ec2
            .request_spot_instance(SpotRequestSpec {
                launch,
                price: bid.price,
                valid_until,
            })
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(worker = %worker, pair = %bid.pair, error = %e, "Spot request failed");
                return Ok(None);
            }
        };

        let ec2 = &self.ec2;
        let status = wait_for_resource(
            WaitConfig::fixed(
                SPOT_FULFILLMENT_POLL_INTERVAL,
                Some(SPOT_FULFILLMENT_MAX_ATTEMPTS),
            ),
            None,
            || {
                let request_id = &request_id;
                async move {
                    Ok(match ec2.describe_spot_request(request_id).await? {
                        SpotRequestStatus::Fulfilled { instance_id } => {
                            Some(Fulfilment::Fulfilled(instance_id))
                        }
                        SpotRequestStatus::Open { .. } => None,
                        SpotRequestStatus::Rejected { status_code, .. } => {
                            Some(Fulfilment::Rejected(status_code))
                        }
                    })
                }
            },
            &format!("spot request {request_id}"),
        )
        .await;

        let instance_id = match status {
            Ok(Fulfilment::Fulfilled(instance_id)) => instance_id,
            Ok(Fulfilment::Rejected(status_code)) => {
                info!(
                    worker = %worker,
                    request_id = %request_id,
                    status = status_code.as_deref().unwrap_or("unknown"),
                    "Spot request rejected"
                );
                self.abandon(worker, &request_id).await;
                return Ok(None);
            }
            Err(e) => {
                info!(worker = %worker, request_id = %request_id, error = %e, "Spot request not successful");
                self.abandon(worker, &request_id).await;
                return Ok(None);
            }
        };

        let fulfilled_at = Utc::now();
        info!(
            worker = %worker,
            request_id = %request_id,
            instance_id = %instance_id,
            "Spot request fulfilled"
        );

        if let Err(e) = self.ec2.tag_instance(&instance_id, &tags).await {
            warn!(instance_id = %instance_id, error = ?e, "Failed to tag spot instance");
        }

        let snapshot =
            wait_until_running(self.ec2.as_ref(), worker, &instance_id, offer.ready_timeout)
                .await?;

        Ok(Some(SpotOutcome {
            image_id: snapshot.image_id.unwrap_or(image_id),
            launch_time: snapshot.launch_time,
            instance_id,
            request_id,
            bid: bid.price,
            instance_type: bid.pair.instance_type.clone(),
            zone: bid.pair.zone.clone(),
            subnet_id: bid.pair.subnet_id.clone(),
            fulfilled_at,
        }))
    }

    /// Cancel a request we are giving up on and terminate anything it launched.
    async fn abandon(&self, worker: &str, request_id: &str) {
        if let Err(e) = ignore_not_found(self.ec2.cancel_spot_request(request_id).await) {
            warn!(worker = %worker, request_id = %request_id, error = ?e, "Failed to cancel spot request");
        }

        let late_instance = match self.ec2.describe_spot_request(request_id).await {
            Ok(SpotRequestStatus::Fulfilled { instance_id }) => Some(instance_id),
            Ok(SpotRequestStatus::Rejected { instance_id, .. }) => instance_id,
            Ok(SpotRequestStatus::Open { .. }) => None,
            Err(e) => {
                warn!(request_id = %request_id, error = ?e, "Failed to re-check cancelled spot request");
                None
            }
        };

        if let Some(instance_id) = late_instance {
            warn!(
                worker = %worker,
                request_id = %request_id,
                instance_id = %instance_id,
                "Terminating instance launched by abandoned spot request"
            );
            if let Err(e) = terminate(self.ec2.as_ref(), &instance_id).await {
                warn!(instance_id = %instance_id, error = ?e, "Failed to terminate late spot instance");
            }
        }
    }
}
