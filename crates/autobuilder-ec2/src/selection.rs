//! Worker selection for incoming build requests
//!
//! Preference order:
//! - any non-latent worker over every latent one
//! - running latent workers with free slots over everything else
//! - pending latent workers over stopped or terminating ones
//! - among those, more free slots first
//!
//! Ties go to the earliest candidate, so the result is a pure function of
//! the input slice.

use autobuilder_common::InstanceState;
use autobuilder_common::defaults::RUNNING_WORKER_BONUS;
use serde::Serialize;
use tracing::trace;

/// Latent state of a candidate as seen by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatentStatus {
    /// `None` when the worker has no instance
    pub instance_state: Option<InstanceState>,
}

/// One worker eligible for a build request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerBinding {
    pub name: String,
    pub max_builds: u32,
    pub busy_slots: u32,
    /// `None` for always-on workers
    pub latent: Option<LatentStatus>,
}

impl WorkerBinding {
    pub fn is_latent(&self) -> bool {
        self.latent.is_some()
    }

    fn free_slots(&self) -> i64 {
        (i64::from(self.max_builds) - i64::from(self.busy_slots)).max(0)
    }
}

/// Score a latent candidate. Non-latent candidates are never scored.
pub fn score(binding: &WorkerBinding) -> i64 {
    let state = binding.latent.and_then(|l| l.instance_state);
    match state {
        Some(InstanceState::Running) => {
            let free = binding.free_slots();
            if free > 0 { free + RUNNING_WORKER_BONUS } else { 0 }
        }
        Some(InstanceState::Pending) => binding.free_slots(),
        _ => 0,
    }
}

/// Pick the worker that should receive the next build.
///
/// Returns `None` only for an empty slice.
pub fn select_worker(candidates: &[WorkerBinding]) -> Option<&WorkerBinding> {
    if let Some(fixed) = candidates.iter().find(|c| !c.is_latent()) {
        trace!(worker = %fixed.name, "Selected non-latent worker");
        return Some(fixed);
    }

    let mut best: Option<(&WorkerBinding, i64)> = None;
    for candidate in candidates {
        let s = score(candidate);
        trace!(worker = %candidate.name, score = s, "Scored latent worker");
        if best.is_none_or(|(_, top)| s > top) {
            best = Some((candidate, s));
        }
    }

    best.map(|(worker, s)| {
        trace!(worker = %worker.name, score = s, "Selected latent worker");
        worker
    })
}
