//! EC2 tag constants for autobuilder workers
//!
//! Every instance launched for a latent worker carries these tags so that
//! stray instances can be traced back to the worker that owns them.
//!
//! ## Tag Schema
//!
//! | Tag Key | Description |
//! |---------|-------------|
//! | `Name` | Worker name unless overridden in the worker's tag map |
//! | `autobuilder:worker` | Owning worker name |
//! | `autobuilder:created-at` | RFC 3339 launch timestamp |
//! | `autobuilder:lifecycle` | `on-demand` or `spot` |

/// Conventional EC2 display-name tag
pub const TAG_NAME: &str = "Name";

/// Tag key for the owning worker
pub const TAG_WORKER: &str = "autobuilder:worker";

/// Tag key for creation timestamp (RFC 3339 format)
pub const TAG_CREATED_AT: &str = "autobuilder:created-at";

/// Tag key for the purchase model
pub const TAG_LIFECYCLE: &str = "autobuilder:lifecycle";

/// Purchase model values
pub mod lifecycle {
    /// Fixed on-demand instance
    pub const ON_DEMAND: &str = "on-demand";

    /// Spot instance obtained by bidding
    pub const SPOT: &str = "spot";
}

/// Helper to format creation timestamp for tags
pub fn format_created_at(time: chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339()
}

/// Helper to parse creation timestamp from tags
pub fn parse_created_at(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}
