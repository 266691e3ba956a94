//! Spot bid computation
//!
//! Pure functions: given candidate (instance type, zone) pairs, a pricing
//! policy and a window of price history, produce bids ordered cheapest first.

use crate::aws::ec2::SpotPriceSample;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, trace};

/// How bids are derived
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpotPricing {
    /// Bid `max_price` on every pair
    Flat { max_price: f64 },
    /// Bid the average historical price times `multiplier`, capped at `max_price`
    History {
        multiplier: f64,
        max_price: Option<f64>,
    },
}

impl SpotPricing {
    pub fn max_price(&self) -> Option<f64> {
        match *self {
            SpotPricing::Flat { max_price } => Some(max_price),
            SpotPricing::History { max_price, .. } => max_price,
        }
    }

    /// Whether bids depend on price history
    pub fn needs_history(&self) -> bool {
        matches!(self, SpotPricing::History { .. })
    }
}

/// A zone a spot worker may launch into, with the subnet serving it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotZone {
    pub zone: String,
    pub subnet_id: Option<String>,
}

/// One (instance type, zone) candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpotPair {
    pub instance_type: String,
    pub zone: String,
    pub subnet_id: Option<String>,
}

impl std::fmt::Display for SpotPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.instance_type, self.zone)
    }
}

/// A pair together with the price to bid for it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bid {
    pub pair: SpotPair,
    pub price: f64,
}

/// Bids for one spot attempt, cheapest first
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BidTable {
    pub bids: Vec<Bid>,
    /// Pairs with no price history in the window
    pub skipped: Vec<SpotPair>,
}

impl BidTable {
    pub fn is_empty(&self) -> bool {
        self.bids.is_empty()
    }

    /// Bid for a specific pair, if one was computed
    pub fn bid_for(&self, instance_type: &str, zone: &str) -> Option<f64> {
        self.bids
            .iter()
            .find(|b| b.pair.instance_type == instance_type && b.pair.zone == zone)
            .map(|b| b.price)
    }
}

/// Cross product of instance types and zones, type-major.
pub fn candidate_pairs(instance_types: &[String], zones: &[SpotZone]) -> Vec<SpotPair> {
    instance_types
        .iter()
        .flat_map(|instance_type| {
            zones.iter().map(move |z| SpotPair {
                instance_type: instance_type.clone(),
                zone: z.zone.clone(),
                subnet_id: z.subnet_id.clone(),
            })
        })
        .collect()
}

/// Average price per (instance type, zone)
fn average_prices(history: &[SpotPriceSample]) -> HashMap<(&str, &str), f64> {
    let mut sums: HashMap<(&str, &str), (f64, u32)> = HashMap::new();
    for sample in history {
        let entry = sums
            .entry((sample.instance_type.as_str(), sample.zone.as_str()))
            .or_insert((0.0, 0));
        entry.0 += sample.price;
        entry.1 += 1;
    }
    sums.into_iter()
        .map(|(k, (sum, n))| (k, sum / f64::from(n)))
        .collect()
}

/// Compute bids for `pairs` and order them cheapest first.
///
/// Under `History` pricing a pair without samples is skipped. The sort is
/// stable, so equal bids keep the order of `pairs`.
pub fn compute_bids(
    pairs: Vec<SpotPair>,
    pricing: &SpotPricing,
    history: &[SpotPriceSample],
) -> BidTable {
    let mut table = BidTable::default();

    match *pricing {
        SpotPricing::Flat { max_price } => {
            table.bids = pairs
                .into_iter()
                .map(|pair| Bid {
                    pair,
                    price: max_price,
                })
                .collect();
        }
        SpotPricing::History {
            multiplier,
            max_price,
        } => {
            let averages = average_prices(history);
            for pair in pairs {
                let Some(avg) = averages
                    .get(&(pair.instance_type.as_str(), pair.zone.as_str()))
                    .copied()
                else {
                    debug!(pair = %pair, "No spot price history, skipping");
                    table.skipped.push(pair);
                    continue;
                };
                let mut price = avg * multiplier;
                if let Some(max) = max_price {
                    price = price.min(max);
                }
                trace!(pair = %pair, average = avg, bid = price, "Computed bid");
                table.bids.push(Bid { pair, price });
            }
        }
    }

    table.bids.sort_by(|a, b| a.price.total_cmp(&b.price));
    table
}
