//! Latent worker controller
//!
//! Each latent worker owns one controller. It moves through
//!
//! ```text
//! Idle -> Provisioning -> Running -> Stopping -> Idle
//!              \-> Idle (failure)
//! ```
//!
//! State lives behind a `tokio::sync::Mutex` that is only held to inspect or
//! change the state, never across a network call. Taking the
//! `Idle -> Provisioning` transition under the lock is what rejects a second
//! concurrent substantiation.
//!
//! Two timers run while an instance is up, both cancelled through
//! `CancellationToken`s:
//! - the missing timer stops the instance if the worker never connects
//! - the idle timer stops it once builds have finished and the build-wait
//!   timeout has elapsed

use super::handle::InstanceHandle;
use super::instance::{Teardown, teardown, terminate};
use super::provisioner::{InstanceProvisioner, ProvisionRequest, Provisioner, resolve_image};
use super::quarantine::Quarantine;
use super::spec::{LatentWorkerSpec, Placement};
use crate::aws::ec2::Ec2Operations;
use crate::error::WorkerError;
use crate::selection::LatentStatus;
use autobuilder_common::InstanceState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a latent worker
#[derive(Debug, Clone, PartialEq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ControllerState {
    Idle,
    Provisioning,
    Running(InstanceHandle),
    Stopping,
}

#[derive(Debug)]
struct Inner {
    state: ControllerState,
    /// Where the last instance landed
    placement: Option<Placement>,
    quarantine: Quarantine,
    active_builds: u32,
    connected: bool,
    idle_timer: Option<CancellationToken>,
    missing_timer: Option<CancellationToken>,
}

impl Inner {
    fn cancel_timers(&mut self) {
        if let Some(token) = self.idle_timer.take() {
            token.cancel();
        }
        if let Some(token) = self.missing_timer.take() {
            token.cancel();
        }
    }
}

/// Drives one latent worker's instance through its lifecycle
pub struct LatentWorkerController<E> {
    name: Arc<str>,
    spec: Arc<LatentWorkerSpec>,
    ec2: Arc<E>,
    inner: Arc<Mutex<Inner>>,
}

impl<E> Clone for LatentWorkerController<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            spec: self.spec.clone(),
            ec2: self.ec2.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<E: Ec2Operations + 'static> LatentWorkerController<E> {
    pub fn new(name: impl Into<String>, spec: Arc<LatentWorkerSpec>, ec2: Arc<E>) -> Self {
        let quarantine = Quarantine::new(spec.quarantine);
        Self {
            name: Arc::from(name.into()),
            spec,
            ec2,
            inner: Arc::new(Mutex::new(Inner {
                state: ControllerState::Idle,
                placement: None,
                quarantine,
                active_builds: 0,
                connected: false,
                idle_timer: None,
                missing_timer: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &LatentWorkerSpec {
        &self.spec
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ControllerState {
        self.inner.lock().await.state.clone()
    }

    /// Placement of the most recent instance
    pub async fn placement(&self) -> Option<Placement> {
        self.inner.lock().await.placement.clone()
    }

    /// Instance state as seen by worker selection
    pub async fn latent_status(&self) -> LatentStatus {
        let instance_state = match &self.inner.lock().await.state {
            ControllerState::Idle => None,
            ControllerState::Provisioning => Some(InstanceState::Pending),
            ControllerState::Running(handle) => Some(handle.state),
            ControllerState::Stopping => Some(InstanceState::ShuttingDown),
        };
        LatentStatus { instance_state }
    }

    /// Remaining quarantine, if any
    pub async fn quarantine_remaining(&self) -> Option<Duration> {
        self.inner.lock().await.quarantine.remaining(Instant::now())
    }

    /// Provision an instance for this worker.
    ///
    /// Fails with `Busy` unless idle and with `Quarantined` while a previous
    /// failure's quarantine is in effect. Other failures escalate the
    /// quarantine, except configuration errors; success resets it.
    pub async fn substantiate(&self) -> Result<InstanceHandle, WorkerError> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(remaining) = inner.quarantine.remaining(Instant::now()) {
                return Err(WorkerError::Quarantined {
                    worker: self.name.to_string(),
                    remaining,
                });
            }
            if inner.state != ControllerState::Idle {
                return Err(WorkerError::Busy {
                    worker: self.name.to_string(),
                    state: inner.state.to_string(),
                });
            }
            inner.state = ControllerState::Provisioning;
        }

        info!(worker = %self.name, spot = self.spec.sizing.is_spot(), "Substantiating worker");

        // Provisioning runs on its own task so that a dropped caller cannot
        // strand the worker in `Provisioning` or orphan a launched instance.
        let this = self.clone();
        match tokio::spawn(async move { this.provision_and_commit().await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(worker = %self.name, error = %e, "Provisioning task failed");
                self.inner.lock().await.state = ControllerState::Idle;
                Err(WorkerError::LaunchFailed {
                    worker: self.name.to_string(),
                    source: anyhow::anyhow!("provisioning task failed: {e}"),
                })
            }
        }
    }

    async fn provision_and_commit(&self) -> Result<InstanceHandle, WorkerError> {
        let result = self.provision().await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(handle) => {
                inner.quarantine.reset();
                inner.placement = Some(handle.placement.clone());
                inner.state = ControllerState::Running(handle.clone());
                inner.active_builds = 0;
                inner.connected = false;
                inner.missing_timer = Some(self.start_missing_timer());
                info!(
                    worker = %self.name,
                    instance_id = %handle.instance_id,
                    instance_type = %handle.placement.instance_type,
                    zone = ?handle.placement.zone,
                    "Worker substantiated"
                );
                Ok(handle)
            }
            Err(e) => {
                inner.state = ControllerState::Idle;
                if e.escalates_quarantine() {
                    let timeout = inner.quarantine.escalate(Instant::now());
                    warn!(
                        worker = %self.name,
                        error = %e,
                        kind = %e.kind(),
                        quarantine_secs = timeout.as_secs(),
                        "Substantiation failed, worker quarantined"
                    );
                } else {
                    warn!(worker = %self.name, error = %e, "Substantiation failed");
                }
                Err(e)
            }
        }
    }

    async fn provision(&self) -> Result<InstanceHandle, WorkerError> {
        let worker = self.name.as_ref();
        let ec2 = self.ec2.as_ref();

        // Resolve the elastic IP before launching so a bad address fails
        // without leaving an instance behind.
        let allocation_id = match &self.spec.elastic_ip {
            Some(ip) => {
                let address = ec2.find_elastic_ip(ip).await.map_err(|source| {
                    WorkerError::LaunchFailed {
                        worker: worker.to_string(),
                        source,
                    }
                })?;
                let allocation = address.and_then(|a| a.allocation_id).ok_or_else(|| {
                    WorkerError::Config {
                        worker: worker.to_string(),
                        message: format!("could not find elastic IP {ip}"),
                    }
                })?;
                Some(allocation)
            }
            None => None,
        };

        let image_id = resolve_image(ec2, worker, &self.spec.image).await?;
        let provisioner = Provisioner::for_spec(self.ec2.clone(), &self.spec);
        let mut handle = match provisioner
            .provision(ProvisionRequest {
                worker,
                spec: &self.spec,
                image_id: &image_id,
            })
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                if let WorkerError::FailedToStart { instance_id, .. } = &e {
                    self.discard_instance(instance_id).await;
                }
                return Err(e);
            }
        };

        if let Some(allocation_id) = allocation_id {
            match ec2.associate_address(&allocation_id, &handle.instance_id).await {
                Ok(association_id) => handle.elastic_ip_association = Some(association_id),
                Err(source) => {
                    self.discard_instance(&handle.instance_id).await;
                    return Err(WorkerError::LaunchFailed {
                        worker: worker.to_string(),
                        source,
                    });
                }
            }
        }

        Ok(handle)
    }

    /// Terminate an instance that will not be used
    async fn discard_instance(&self, instance_id: &str) {
        warn!(worker = %self.name, instance_id = %instance_id, "Terminating unusable instance");
        if let Err(e) = terminate(self.ec2.as_ref(), instance_id).await {
            error!(
                worker = %self.name,
                instance_id = %instance_id,
                error = ?e,
                "Failed to terminate unusable instance"
            );
        }
    }

    /// Tear down the running instance and return to idle.
    ///
    /// A no-op when idle. Returns `Busy` while provisioning or already
    /// stopping. On error the worker stays running so the stop can be retried.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let handle = {
            let mut inner = self.inner.lock().await;
            match std::mem::replace(&mut inner.state, ControllerState::Stopping) {
                ControllerState::Running(handle) => {
                    inner.cancel_timers();
                    handle
                }
                ControllerState::Idle => {
                    inner.state = ControllerState::Idle;
                    debug!(worker = %self.name, "Stop requested while idle");
                    return Ok(());
                }
                other => {
                    let state = other.to_string();
                    inner.state = other;
                    return Err(WorkerError::Busy {
                        worker: self.name.to_string(),
                        state,
                    });
                }
            }
        };

        info!(worker = %self.name, instance_id = %handle.instance_id, "Stopping worker");
        let plan = Teardown {
            elastic_ip_association: handle.elastic_ip_association.clone(),
            disassociate_dynamic_addresses: self.spec.disassociate_dynamic_addresses,
        };
        let result = teardown(self.ec2.as_ref(), &self.name, &handle.instance_id, &plan).await;

        let mut inner = self.inner.lock().await;
        match result {
            Ok(()) => {
                inner.state = ControllerState::Idle;
                inner.active_builds = 0;
                Ok(())
            }
            Err(source) => {
                error!(worker = %self.name, instance_id = %handle.instance_id, error = ?source, "Teardown failed");
                inner.state = ControllerState::Running(handle);
                Err(WorkerError::TeardownFailed {
                    worker: self.name.to_string(),
                    source,
                })
            }
        }
    }

    /// Tear down an instance this controller did not launch itself.
    ///
    /// Used to clean up after a previous process; the configured elastic IP
    /// is released only if it is attached to `instance_id`.
    pub async fn stop_instance(&self, instance_id: &str) -> anyhow::Result<()> {
        let elastic_ip_association = match &self.spec.elastic_ip {
            Some(ip) => self
                .ec2
                .find_elastic_ip(ip)
                .await?
                .filter(|a| a.instance_id.as_deref() == Some(instance_id))
                .and_then(|a| a.association_id),
            None => None,
        };
        let plan = Teardown {
            elastic_ip_association,
            disassociate_dynamic_addresses: self.spec.disassociate_dynamic_addresses,
        };
        teardown(self.ec2.as_ref(), &self.name, instance_id, &plan).await
    }

    /// Run `stop` on its own task so that a dropped caller cannot leave the
    /// instance running.
    pub fn stop_detached(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.stop().await {
                error!(worker = %this.name, error = %e, "Detached stop failed");
            }
        })
    }

    /// The worker process on the instance has connected
    pub async fn worker_connected(&self) {
        let mut inner = self.inner.lock().await;
        inner.connected = true;
        if let Some(token) = inner.missing_timer.take() {
            token.cancel();
        }
        debug!(worker = %self.name, "Worker connected");
    }

    /// A build started on this worker
    pub async fn build_started(&self) {
        let mut inner = self.inner.lock().await;
        inner.active_builds += 1;
        if let Some(token) = inner.idle_timer.take() {
            debug!(worker = %self.name, "Build started, idle release cancelled");
            token.cancel();
        }
    }

    /// A build finished; schedule release once the worker has been idle
    /// for the build-wait timeout.
    pub async fn build_finished(&self) {
        let mut inner = self.inner.lock().await;
        inner.active_builds = inner.active_builds.saturating_sub(1);
        if inner.active_builds > 0 || !matches!(inner.state, ControllerState::Running(_)) {
            return;
        }
        if let Some(token) = inner.idle_timer.take() {
            token.cancel();
        }

        let wait = self.spec.timeouts.build_wait;
        debug!(worker = %self.name, wait_secs = wait.as_secs(), "Worker idle, scheduling release");
        let token = CancellationToken::new();
        inner.idle_timer = Some(token.clone());

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    info!(worker = %this.name, "Build-wait timeout elapsed, releasing instance");
                    if let Err(e) = this.stop().await {
                        error!(worker = %this.name, error = %e, "Idle release failed");
                    }
                }
            }
        });
    }

    fn start_missing_timer(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let timeout = self.spec.timeouts.missing;
        let this = self.clone();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(timeout) => this.on_missing().await,
            }
        });
        token
    }

    async fn on_missing(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.connected || !matches!(inner.state, ControllerState::Running(_)) {
                return;
            }
            inner.missing_timer = None;
            let timeout = inner.quarantine.escalate(Instant::now());
            warn!(
                worker = %self.name,
                missing_secs = self.spec.timeouts.missing.as_secs(),
                quarantine_secs = timeout.as_secs(),
                "Worker never connected, stopping instance"
            );
        }
        if let Err(e) = self.stop().await {
            error!(worker = %self.name, error = %e, "Failed to stop missing worker");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::SpotPricing;
    use crate::testing::{FakeEc2, SpotBehaviour, fixed_spec, spot_spec};

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn controller(ec2: &Arc<FakeEc2>, spec: LatentWorkerSpec) -> LatentWorkerController<FakeEc2> {
        LatentWorkerController::new("w", Arc::new(spec), ec2.clone())
    }

    /// Let spawned timer tasks run
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_substantiate_and_stop() {
        let ec2 = Arc::new(FakeEc2::default());
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));

        let handle = c.substantiate().await.unwrap();
        assert_eq!(c.state().await, ControllerState::Running(handle.clone()));
        assert_eq!(
            c.latent_status().await.instance_state,
            Some(InstanceState::Running)
        );
        assert_eq!(c.placement().await.unwrap().instance_type, "c5.xlarge");

        c.stop().await.unwrap();
        assert_eq!(c.state().await, ControllerState::Idle);
        assert_eq!(ec2.terminated(), vec![handle.instance_id.clone()]);
        assert_eq!(
            ec2.instance_state(&handle.instance_id),
            Some(InstanceState::Terminated)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_substantiate_is_busy() {
        let ec2 = Arc::new(FakeEc2::default());
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));
        c.substantiate().await.unwrap();

        let err = c.substantiate().await.unwrap_err();
        assert!(matches!(err, WorkerError::Busy { ref state, .. } if state == "running"));
        // Busy does not quarantine
        assert!(c.quarantine_remaining().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_substantiation_is_rejected() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.set_boot_states(&[InstanceState::Pending, InstanceState::Running]);
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));

        let (a, b) = tokio::join!(c.substantiate(), c.substantiate());
        assert!(a.is_ok() ^ b.is_ok());
        assert_eq!(ec2.launches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_quarantines_and_terminates() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.set_boot_states(&[InstanceState::Pending, InstanceState::Terminated]);
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));

        let err = c.substantiate().await.unwrap_err();
        let WorkerError::FailedToStart { instance_id, .. } = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(ec2.terminated(), vec![instance_id.clone()]);
        assert_eq!(c.state().await, ControllerState::Idle);
        assert_eq!(c.quarantine_remaining().await, Some(secs(15 * 60)));

        let err = c.substantiate().await.unwrap_err();
        assert!(matches!(err, WorkerError::Quarantined { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn describe_error_after_launch_does_not_leak_instance() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.fail_describes(1);
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));

        let handle = c.substantiate().await.unwrap();
        assert_eq!(ec2.launches().len(), 1);
        assert_eq!(c.state().await, ControllerState::Running(handle));
    }

    #[tokio::test(start_paused = true)]
    async fn instance_that_never_becomes_visible_is_terminated() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.fail_describes(u32::MAX);
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));

        let err = c.substantiate().await.unwrap_err();
        let WorkerError::FailedToStart { instance_id, .. } = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(ec2.terminated(), vec![instance_id.clone()]);
        assert_eq!(c.state().await, ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_substantiation_still_completes() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.set_boot_states(&[
            InstanceState::Pending,
            InstanceState::Pending,
            InstanceState::Running,
        ]);
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));

        let dropped = tokio::time::timeout(secs(1), c.substantiate()).await;
        assert!(dropped.is_err());

        tokio::time::sleep(secs(120)).await;
        settle().await;
        let ControllerState::Running(handle) = c.state().await else {
            panic!("worker should be running");
        };
        assert_eq!(ec2.launches().len(), 1);
        assert!(ec2.terminated().is_empty());

        c.stop().await.unwrap();
        assert_eq!(ec2.terminated(), vec![handle.instance_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_failing_substantiation_cleans_up() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.set_boot_states(&[InstanceState::Pending]);
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));

        let dropped = tokio::time::timeout(secs(1), c.substantiate()).await;
        assert!(dropped.is_err());

        // Past the ready timeout, still inside the quarantine window
        tokio::time::sleep(secs(20 * 60)).await;
        settle().await;
        assert_eq!(c.state().await, ControllerState::Idle);
        assert_eq!(ec2.launches().len(), 1);
        assert_eq!(ec2.terminated().len(), 1);

        let err = c.substantiate().await.unwrap_err();
        assert!(matches!(err, WorkerError::Quarantined { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_release_survives_failed_terminate() {
        let ec2 = Arc::new(FakeEc2::default());
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));
        let handle = c.substantiate().await.unwrap();
        c.worker_connected().await;
        ec2.fail_terminates(1);

        c.build_started().await;
        c.build_finished().await;
        settle().await;
        tokio::time::sleep(secs(3 * 60 * 60)).await;
        settle().await;

        assert_eq!(c.state().await, ControllerState::Idle);
        assert_eq!(ec2.terminated(), vec![handle.instance_id.clone()]);
        assert_eq!(
            ec2.instance_state(&handle.instance_id),
            Some(InstanceState::Terminated)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn quarantine_doubles_then_resets_on_success() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.fail_launches(2, "InsufficientInstanceCapacity");
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));

        let err = c.substantiate().await.unwrap_err();
        assert!(matches!(err, WorkerError::LaunchFailed { .. }));
        assert_eq!(c.quarantine_remaining().await, Some(secs(15 * 60)));

        tokio::time::advance(secs(15 * 60)).await;
        c.substantiate().await.unwrap_err();
        assert_eq!(c.quarantine_remaining().await, Some(secs(30 * 60)));

        tokio::time::advance(secs(30 * 60)).await;
        c.substantiate().await.unwrap();
        assert!(c.quarantine_remaining().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn elastic_ip_associated_and_released() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.add_elastic_ip("203.0.113.5", "eipalloc-1");
        let mut spec = fixed_spec("c5.xlarge", None);
        spec.elastic_ip = Some("203.0.113.5".into());
        let c = controller(&ec2, spec);

        let handle = c.substantiate().await.unwrap();
        let association = handle.elastic_ip_association.clone().unwrap();
        let address = ec2.find_elastic_ip("203.0.113.5").await.unwrap().unwrap();
        assert_eq!(address.instance_id.as_deref(), Some(handle.instance_id.as_str()));

        c.stop().await.unwrap();
        assert_eq!(ec2.disassociated(), vec![association]);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_elastic_ip_fails_before_launch() {
        let ec2 = Arc::new(FakeEc2::default());
        let mut spec = fixed_spec("c5.xlarge", None);
        spec.elastic_ip = Some("203.0.113.99".into());
        let c = controller(&ec2, spec);

        let err = c.substantiate().await.unwrap_err();
        assert!(matches!(err, WorkerError::Config { .. }));
        assert!(ec2.launches().is_empty());
        assert!(c.quarantine_remaining().await.is_none());
        assert_eq!(c.state().await, ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_worker_records_fulfilment() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.add_subnet("subnet-a", "us-east-1a");
        ec2.set_spot_behaviour("m5.large", "us-east-1a", SpotBehaviour::FulfilAfter(2));
        let c = controller(
            &ec2,
            spot_spec(&["m5.large"], &["subnet-a"], SpotPricing::Flat { max_price: 0.2 }),
        );

        let handle = c.substantiate().await.unwrap();
        let spot = handle.spot.unwrap();
        assert!((spot.bid - 0.2).abs() < 1e-9);
        assert_eq!(c.placement().await.unwrap().zone.as_deref(), Some("us-east-1a"));
    }

    #[tokio::test(start_paused = true)]
    async fn spot_exhaustion_quarantines() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.add_subnet("subnet-a", "us-east-1a");
        let c = controller(
            &ec2,
            spot_spec(&["m5.large"], &["subnet-a"], SpotPricing::Flat { max_price: 0.2 }),
        );

        let err = c.substantiate().await.unwrap_err();
        assert!(matches!(err, WorkerError::SpotExhausted { .. }));
        assert!(err.is_infrastructure_failure());
        assert!(c.quarantine_remaining().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_while_idle_is_noop() {
        let ec2 = Arc::new(FakeEc2::default());
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));
        c.stop().await.unwrap();
        assert!(ec2.terminated().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_release_after_build_wait() {
        let ec2 = Arc::new(FakeEc2::default());
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));
        c.substantiate().await.unwrap();
        c.worker_connected().await;

        c.build_started().await;
        c.build_finished().await;
        settle().await;

        tokio::time::sleep(secs(299)).await;
        assert!(matches!(c.state().await, ControllerState::Running(_)));

        // A new build cancels the pending release
        c.build_started().await;
        tokio::time::sleep(secs(10)).await;
        assert!(matches!(c.state().await, ControllerState::Running(_)));

        c.build_finished().await;
        tokio::time::sleep(secs(301)).await;
        settle().await;
        tokio::time::sleep(secs(10)).await;
        assert_eq!(c.state().await, ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn spot_workers_release_immediately() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.add_subnet("subnet-a", "us-east-1a");
        ec2.set_spot_behaviour("m5.large", "us-east-1a", SpotBehaviour::FulfilAfter(1));
        let c = controller(
            &ec2,
            spot_spec(&["m5.large"], &["subnet-a"], SpotPricing::Flat { max_price: 0.2 }),
        );
        c.substantiate().await.unwrap();
        c.worker_connected().await;

        c.build_started().await;
        c.build_finished().await;
        settle().await;
        tokio::time::sleep(secs(10)).await;
        assert_eq!(c.state().await, ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_worker_is_stopped() {
        let ec2 = Arc::new(FakeEc2::default());
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));
        let handle = c.substantiate().await.unwrap();

        tokio::time::sleep(secs(20 * 60 + 1)).await;
        settle().await;
        tokio::time::sleep(secs(10)).await;

        assert_eq!(c.state().await, ControllerState::Idle);
        assert_eq!(ec2.terminated(), vec![handle.instance_id]);
        assert!(c.quarantine_remaining().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn connected_worker_is_not_missing() {
        let ec2 = Arc::new(FakeEc2::default());
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));
        c.substantiate().await.unwrap();
        c.worker_connected().await;

        tokio::time::sleep(secs(30 * 60)).await;
        settle().await;
        assert!(matches!(c.state().await, ControllerState::Running(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn detached_stop_completes() {
        let ec2 = Arc::new(FakeEc2::default());
        let c = controller(&ec2, fixed_spec("c5.xlarge", None));
        let handle = c.substantiate().await.unwrap();

        c.stop_detached().await.unwrap();
        assert_eq!(c.state().await, ControllerState::Idle);
        assert_eq!(ec2.terminated(), vec![handle.instance_id]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_instance_releases_matching_elastic_ip() {
        let ec2 = Arc::new(FakeEc2::default());
        ec2.add_elastic_ip("203.0.113.5", "eipalloc-1");
        let id = ec2.add_instance(&[InstanceState::Running]);
        let association = ec2.associate_address("eipalloc-1", &id).await.unwrap();
        let mut spec = fixed_spec("c5.xlarge", None);
        spec.elastic_ip = Some("203.0.113.5".into());
        let c = controller(&ec2, spec);

        c.stop_instance(&id).await.unwrap();
        assert_eq!(ec2.disassociated(), vec![association]);
        assert_eq!(ec2.instance_state(&id), Some(InstanceState::Terminated));
    }
}
