//! Domain errors for configuration loading and worker substantiation

use autobuilder_common::InstanceState;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid or unreadable farm configuration. Fatal at load time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Worker {worker}: {message}")]
    Invalid { worker: String, message: String },

    #[error("Duplicate worker name: {0}")]
    DuplicateWorker(String),

    #[error("Worker {worker}: invalid AMI name regex: {source}")]
    Regex {
        worker: String,
        #[source]
        source: regex::Error,
    },

    #[error("Worker {worker}: user data template: {source}")]
    Template {
        worker: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),
}

impl ConfigError {
    pub(crate) fn invalid(worker: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            worker: worker.to_string(),
            message: message.into(),
        }
    }
}

/// Broad category of a substantiation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum FailureKind {
    /// The worker definition itself is wrong; retrying will not help
    Configuration,
    /// No capacity could be obtained at an acceptable price
    Capacity,
    /// An instance was requested but never became usable
    Provisioning,
}

/// Why a worker could not be substantiated
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker {worker}: configuration error: {message}")]
    Config { worker: String, message: String },

    #[error("Worker {worker} is already {state}")]
    Busy { worker: String, state: String },

    #[error("Worker {worker} is quarantined for another {remaining:?}")]
    Quarantined { worker: String, remaining: Duration },

    #[error("Worker {worker}: launch failed: {source:#}")]
    LaunchFailed {
        worker: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Worker {worker}: instance {instance_id} failed to start (state: {state})")]
    FailedToStart {
        worker: String,
        instance_id: String,
        state: InstanceState,
    },

    #[error("Worker {worker}: {reason}")]
    SpotExhausted { worker: String, reason: String },

    #[error("Worker {worker}: teardown failed: {source:#}")]
    TeardownFailed {
        worker: String,
        #[source]
        source: anyhow::Error,
    },
}

impl WorkerError {
    /// Failure category
    pub fn kind(&self) -> FailureKind {
        match self {
            WorkerError::Config { .. } => FailureKind::Configuration,
            WorkerError::SpotExhausted { .. } => FailureKind::Capacity,
            WorkerError::LaunchFailed { source, .. }
                if crate::aws::classify_anyhow_error(source).is_capacity() =>
            {
                FailureKind::Capacity
            }
            WorkerError::Busy { .. }
            | WorkerError::Quarantined { .. }
            | WorkerError::LaunchFailed { .. }
            | WorkerError::FailedToStart { .. }
            | WorkerError::TeardownFailed { .. } => FailureKind::Provisioning,
        }
    }

    /// Capacity or provisioning problem rather than a configuration mistake
    pub fn is_infrastructure_failure(&self) -> bool {
        self.kind() != FailureKind::Configuration
    }

    /// Whether this failure should count against the worker's quarantine.
    ///
    /// Configuration errors do not: waiting will not fix them.
    pub(crate) fn escalates_quarantine(&self) -> bool {
        !matches!(
            self,
            WorkerError::Config { .. } | WorkerError::Busy { .. } | WorkerError::Quarantined { .. }
        )
    }

    /// Name of the worker that failed
    pub fn worker(&self) -> &str {
        match self {
            WorkerError::Config { worker, .. }
            | WorkerError::Busy { worker, .. }
            | WorkerError::Quarantined { worker, .. }
            | WorkerError::LaunchFailed { worker, .. }
            | WorkerError::FailedToStart { worker, .. }
            | WorkerError::SpotExhausted { worker, .. }
            | WorkerError::TeardownFailed { worker, .. } => worker,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        let config = WorkerError::Config {
            worker: "w".into(),
            message: "no AMI".into(),
        };
        assert_eq!(config.kind(), FailureKind::Configuration);
        assert!(!config.is_infrastructure_failure());

        let spot = WorkerError::SpotExhausted {
            worker: "w".into(),
            reason: "exhausted instance types".into(),
        };
        assert_eq!(spot.kind(), FailureKind::Capacity);
        assert!(spot.is_infrastructure_failure());

        let start = WorkerError::FailedToStart {
            worker: "w".into(),
            instance_id: "i-1".into(),
            state: InstanceState::Terminated,
        };
        assert_eq!(start.kind(), FailureKind::Provisioning);
        assert_eq!(
            start.to_string(),
            "Worker w: instance i-1 failed to start (state: terminated)"
        );
    }

    #[test]
    fn capacity_launch_errors_are_capacity() {
        let err = WorkerError::LaunchFailed {
            worker: "w".into(),
            source: anyhow::anyhow!("InsufficientInstanceCapacity: none left"),
        };
        assert_eq!(err.kind(), FailureKind::Capacity);

        let err = WorkerError::LaunchFailed {
            worker: "w".into(),
            source: anyhow::anyhow!("AuthFailure"),
        };
        assert_eq!(err.kind(), FailureKind::Provisioning);
    }

    #[test]
    fn busy_quarantined_and_config_do_not_escalate() {
        let busy = WorkerError::Busy {
            worker: "w".into(),
            state: "running".into(),
        };
        assert!(!busy.escalates_quarantine());
        let config = WorkerError::Config {
            worker: "w".into(),
            message: "could not find elastic IP 203.0.113.99".into(),
        };
        assert!(!config.escalates_quarantine());
        let exhausted = WorkerError::SpotExhausted {
            worker: "w".into(),
            reason: "x".into(),
        };
        assert!(exhausted.escalates_quarantine());
        assert_eq!(exhausted.worker(), "w");
    }

    #[test]
    fn failure_kind_display() {
        assert_eq!(FailureKind::Capacity.to_string(), "capacity");
    }
}
