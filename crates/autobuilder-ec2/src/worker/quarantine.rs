//! Failure quarantine with exponential escalation

use super::spec::QuarantinePolicy;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks how long a worker must sit out after failed substantiations.
///
/// The first failure quarantines for `policy.initial`; every further failure
/// doubles the window up to `policy.max`. A success resets it.
#[derive(Debug, Clone)]
pub struct Quarantine {
    policy: QuarantinePolicy,
    timeout: Option<Duration>,
    until: Option<Instant>,
}

impl Quarantine {
    pub fn new(policy: QuarantinePolicy) -> Self {
        Self {
            policy,
            timeout: None,
            until: None,
        }
    }

    /// Time left in quarantine, `None` if not quarantined
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// Record a failure and return the new quarantine window
    pub fn escalate(&mut self, now: Instant) -> Duration {
        let next = match self.timeout {
            None => self.policy.initial,
            Some(current) => current.saturating_mul(2).min(self.policy.max),
        };
        self.timeout = Some(next);
        self.until = Some(now + next);
        next
    }

    /// Record a success
    pub fn reset(&mut self) {
        self.timeout = None;
        self.until = None;
    }

    /// Current window length, if any failure has been recorded
    pub fn current_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
