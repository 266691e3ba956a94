//! Canonical EC2 instance lifecycle states
//!
//! Mirrors the `InstanceStateName` values reported by EC2 so that code without
//! an SDK dependency (selection, dispatch) can reason about instance state.

use serde::{Deserialize, Serialize};

/// EC2 instance lifecycle state
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum InstanceState {
    /// Launch accepted, instance booting
    #[default]
    Pending,
    /// Instance is running
    Running,
    /// Termination in progress
    ShuttingDown,
    /// Instance is gone
    Terminated,
    /// Stop in progress (EBS-backed instances only)
    Stopping,
    /// Instance is stopped
    Stopped,
}

impl InstanceState {
    /// Pending or running: the instance is (or will shortly be) usable.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Shutting down or terminated: nothing left to terminate.
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Terminated)
    }

    /// Parse from the EC2 state name, returning None for unknown values
    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}
