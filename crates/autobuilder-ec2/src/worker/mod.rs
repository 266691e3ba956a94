//! Workers and the latent-worker lifecycle
//!
//! - spec: immutable per-worker provisioning parameters
//! - provisioner: fixed on-demand and spot strategies
//! - controller: per-worker state machine
//! - instance: readiness and teardown waits
//! - quarantine: failure back-off

pub mod controller;
pub mod handle;
pub mod instance;
pub mod provisioner;
pub mod quarantine;
pub mod spec;

pub use controller::{ControllerState, LatentWorkerController};
pub use handle::{InstanceHandle, SpotFulfilment};
pub use provisioner::{
    FixedInstanceProvisioner, InstanceProvisioner, ProvisionRequest, Provisioner,
    SpotInstanceProvisioner,
};
pub use spec::{
    ImageSelector, InstanceSizing, LatentWorkerSpec, Placement, QuarantinePolicy, WorkerTimeouts,
};

use crate::selection::{LatentStatus, WorkerBinding};

/// Always-on or EC2-backed
#[derive(Debug, Clone)]
pub enum WorkerKind {
    /// A permanently connected worker
    Fixed,
    /// A worker whose instance is started on demand
    Latent(Box<LatentWorkerSpec>),
}

/// A build worker as loaded from the farm configuration
#[derive(Debug, Clone)]
pub struct Worker {
    pub name: String,
    /// Shared secret the worker authenticates with
    pub password: String,
    pub max_builds: u32,
    pub kind: WorkerKind,
}

impl Worker {
    pub fn is_latent(&self) -> bool {
        matches!(self.kind, WorkerKind::Latent(_))
    }

    pub fn latent_spec(&self) -> Option<&LatentWorkerSpec> {
        match &self.kind {
            WorkerKind::Latent(spec) => Some(spec),
            WorkerKind::Fixed => None,
        }
    }

    /// Candidate entry for worker selection
    pub fn binding(&self, busy_slots: u32, latent: Option<LatentStatus>) -> WorkerBinding {
        WorkerBinding {
            name: self.name.clone(),
            max_builds: self.max_builds,
            busy_slots,
            latent: if self.is_latent() {
                Some(latent.unwrap_or(LatentStatus {
                    instance_state: None,
                }))
            } else {
                None
            },
        }
    }
}
