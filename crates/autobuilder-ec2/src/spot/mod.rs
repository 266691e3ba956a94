//! Spot capacity: bid computation and the request loop

pub mod bid;
pub mod bidder;

pub use bid::{Bid, BidTable, SpotPair, SpotPricing, SpotZone, candidate_pairs, compute_bids};
pub use bidder::{EXHAUSTED_REASON, SpotBidder, SpotOffer, SpotOutcome};
