//! Default configuration values for latent EC2 workers
//!
//! Cloud boot times are far longer than the generic latent-worker defaults of
//! a CI framework, so the quarantine and readiness values here are tuned for
//! EC2.

use std::time::Duration;

/// Default build-wait timeout for on-demand workers (5 minutes)
pub const DEFAULT_ON_DEMAND_BUILD_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default build-wait timeout for spot workers.
///
/// Spot instances are released as soon as they go idle; they are apt to be
/// reclaimed before a second build would arrive anyway.
pub const DEFAULT_SPOT_BUILD_WAIT_TIMEOUT: Duration = Duration::ZERO;

/// Initial quarantine after a failed substantiation (15 minutes)
pub const DEFAULT_QUARANTINE_INITIAL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Upper bound for quarantine escalation (24 hours)
pub const DEFAULT_QUARANTINE_MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a worker may take to connect after its instance is running (20 minutes)
pub const DEFAULT_MISSING_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Maximum time to wait for a launched instance to leave `pending` (10 minutes)
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(600);

/// Default maximum concurrent builds per worker
pub const DEFAULT_MAX_BUILDS: u32 = 1;

/// Default spot price-history product description
pub const DEFAULT_PRODUCT_DESCRIPTION: &str = "Linux/UNIX";

/// Trailing window of spot price history used to compute bids
pub const SPOT_PRICE_HISTORY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifetime of a single spot request before EC2 expires it
pub const SPOT_REQUEST_VALID_FOR: Duration = Duration::from_secs(60);

/// Interval between spot fulfilment checks
pub const SPOT_FULFILLMENT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Number of spot fulfilment checks before moving to the next candidate
pub const SPOT_FULFILLMENT_MAX_ATTEMPTS: u32 = 6;

/// Interval between termination checks during teardown
pub const TERMINATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Score bonus for a running latent worker with free slots
pub const RUNNING_WORKER_BONUS: i64 = 100;

/// Default scratch volume device name
pub const DEFAULT_SCRATCH_DEVICE: &str = "/dev/xvdf";

/// Default scratch volume size in GiB
pub const DEFAULT_SCRATCH_SIZE_GIB: i32 = 200;

/// Default scratch volume type
pub const DEFAULT_SCRATCH_VOLUME_TYPE: &str = "standard";

/// Provisioned IOPS used for `io1` volumes when none are configured
pub const DEFAULT_IO1_IOPS: i32 = 1000;

// Serde default functions for struct field defaults

/// Returns the default max builds
pub fn default_max_builds() -> u32 {
    DEFAULT_MAX_BUILDS
}

/// Returns the default product description
pub fn default_product_description() -> String {
    DEFAULT_PRODUCT_DESCRIPTION.to_string()
}

/// Returns the default scratch device name
pub fn default_scratch_device() -> String {
    DEFAULT_SCRATCH_DEVICE.to_string()
}

/// Returns the default scratch volume size
pub fn default_scratch_size() -> i32 {
    DEFAULT_SCRATCH_SIZE_GIB
}

/// Returns the default scratch volume type
pub fn default_scratch_volume_type() -> String {
    DEFAULT_SCRATCH_VOLUME_TYPE.to_string()
}
