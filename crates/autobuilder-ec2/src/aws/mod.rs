//! AWS client modules for the latent-worker engine
//!
//! - context: shared SDK configuration (region, credentials profile)
//! - ec2: instance, spot request and elastic IP operations
//! - error: error classification for retry and teardown decisions
//! - tags: standard instance tags

pub mod context;
pub mod ec2;
pub mod error;
pub mod tags;

pub use context::AwsContext;
pub use ec2::{Ec2Client, Ec2Operations};
pub use error::{AwsError, classify_anyhow_error, classify_aws_error, ignore_not_found};
