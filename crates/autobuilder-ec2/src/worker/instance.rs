//! Instance readiness and teardown
//!
//! Both waits go through `wait_for_resource`. Readiness is bounded by the
//! worker's ready timeout; teardown polls at a fixed interval with no limit,
//! because an instance left running costs money until someone notices.

use crate::aws::ec2::{Ec2Operations, InstanceSnapshot};
use crate::aws::error::ignore_not_found;
use crate::error::WorkerError;
use crate::wait::{WaitConfig, wait_for_resource};
use autobuilder_common::InstanceState;
use autobuilder_common::defaults::TERMINATION_POLL_INTERVAL;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Poll until `instance_id` is running.
///
/// Any state other than pending/running fails immediately with
/// `FailedToStart`, as does still being pending when `timeout` expires.
/// Errors from the state check are logged and polling continues, so every
/// failure carries the instance id for the caller to clean up.
pub async fn wait_until_running<E: Ec2Operations>(
    ec2: &E,
    worker: &str,
    instance_id: &str,
    timeout: Duration,
) -> Result<InstanceSnapshot, WorkerError> {
    info!(
        worker = %worker,
        instance_id = %instance_id,
        timeout_secs = timeout.as_secs(),
        "Waiting for instance to be running"
    );

    let last_state = Mutex::new(InstanceState::Pending);

    let result = wait_for_resource(
        WaitConfig::backoff(Duration::from_secs(2), Duration::from_secs(15), timeout),
        None,
        || {
            let last_state = &last_state;
            async move {
                let snapshot = match ec2.describe_instance(instance_id).await {
                    Ok(Some(snapshot)) => snapshot,
                    Ok(None) => {
                        // Freshly launched instances can be briefly invisible
                        debug!(instance_id = %instance_id, "Instance not visible yet");
                        return Ok(None);
                    }
                    Err(e) => {
                        warn!(instance_id = %instance_id, error = ?e, "Error checking instance state");
                        return Ok(None);
                    }
                };
                if let Ok(mut s) = last_state.lock() {
                    *s = snapshot.state;
                }
                match snapshot.state {
                    InstanceState::Running => Ok(Some(Ok(snapshot))),
                    InstanceState::Pending => Ok(None),
                    _ => Ok(Some(Err(snapshot))),
                }
            }
        },
        &format!("instance {instance_id} running"),
    )
    .await;

    let state = last_state
        .into_inner()
        .unwrap_or(InstanceState::Pending);

    match result {
        Ok(Ok(snapshot)) => {
            info!(worker = %worker, instance_id = %instance_id, "Instance is running");
            Ok(snapshot)
        }
        Ok(Err(snapshot)) => {
            warn!(
                worker = %worker,
                instance_id = %instance_id,
                state = %snapshot.state,
                reason = ?snapshot.state_reason,
                "Instance entered unexpected state"
            );
            Err(WorkerError::FailedToStart {
                worker: worker.to_string(),
                instance_id: instance_id.to_string(),
                state: snapshot.state,
            })
        }
        Err(e) => {
            warn!(worker = %worker, instance_id = %instance_id, error = %e, "Instance never became ready");
            Err(WorkerError::FailedToStart {
                worker: worker.to_string(),
                instance_id: instance_id.to_string(),
                state,
            })
        }
    }
}

/// What to release when tearing an instance down
#[derive(Debug, Clone, Default)]
pub struct Teardown {
    /// Association of the configured elastic IP
    pub elastic_ip_association: Option<String>,
    /// Also disassociate every other address on the instance
    pub disassociate_dynamic_addresses: bool,
}

/// Release addresses, terminate and wait until the instance is gone.
///
/// "Not found" at any step counts as done. Failed API calls are logged and
/// repeated at the termination poll interval; there is no limit, so the
/// only way out is an instance that is confirmed terminated or absent.
pub async fn teardown<E: Ec2Operations>(
    ec2: &E,
    worker: &str,
    instance_id: &str,
    plan: &Teardown,
) -> anyhow::Result<()> {
    if let Some(association_id) = &plan.elastic_ip_association {
        info!(worker = %worker, association_id = %association_id, "Disassociating elastic IP");
        until_done(&format!("disassociate {association_id}"), || async {
            ignore_not_found(ec2.disassociate_address(association_id).await)
        })
        .await?;
    }

    if plan.disassociate_dynamic_addresses {
        let addresses = until_done(&format!("addresses of {instance_id}"), || {
            ec2.addresses_for_instance(instance_id)
        })
        .await?;
        for address in addresses {
            let Some(association_id) = address.association_id else {
                continue;
            };
            if plan.elastic_ip_association.as_ref() == Some(&association_id) {
                continue;
            }
            info!(
                worker = %worker,
                public_ip = %address.public_ip,
                association_id = %association_id,
                "Disassociating dynamic address"
            );
            until_done(&format!("disassociate {association_id}"), || async {
                ignore_not_found(ec2.disassociate_address(&association_id).await)
            })
            .await?;
        }
    }

    match ec2.describe_instance(instance_id).await {
        Ok(None) => {
            info!(worker = %worker, instance_id = %instance_id, "Instance already gone");
            return Ok(());
        }
        Ok(Some(snapshot)) if snapshot.state.is_terminating() => {
            debug!(instance_id = %instance_id, state = %snapshot.state, "Instance already terminating");
        }
        Ok(Some(_)) => terminate(ec2, instance_id).await?,
        Err(e) => {
            warn!(instance_id = %instance_id, error = ?e, "Error checking instance state, terminating anyway");
            terminate(ec2, instance_id).await?;
        }
    }

    wait_for_resource(
        WaitConfig::fixed(TERMINATION_POLL_INTERVAL, None),
        None,
        || async {
            match ec2.describe_instance(instance_id).await {
                Ok(None) => Ok(Some(())),
                Ok(Some(s)) if s.state == InstanceState::Terminated => Ok(Some(())),
                Ok(Some(_)) => Ok(None),
                Err(e) => {
                    warn!(instance_id = %instance_id, error = ?e, "Error checking instance state");
                    Ok(None)
                }
            }
        },
        &format!("instance {instance_id} terminated"),
    )
    .await?;

    info!(worker = %worker, instance_id = %instance_id, "Instance terminated");
    Ok(())
}

/// Issue terminate until EC2 accepts it or no longer knows the instance
pub async fn terminate<E: Ec2Operations>(ec2: &E, instance_id: &str) -> anyhow::Result<()> {
    until_done(&format!("terminate {instance_id}"), || async {
        ignore_not_found(ec2.terminate_instance(instance_id).await)
    })
    .await
}

/// Repeat `call` at the termination poll interval until it succeeds
async fn until_done<T, F, Fut>(what: &str, call: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let value = wait_for_resource(
        WaitConfig::fixed(TERMINATION_POLL_INTERVAL, None),
        None,
        || async {
            match call().await {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(call = %what, error = ?e, "Teardown call failed, retrying");
                    Ok(None)
                }
            }
        },
        what,
    )
    .await?;
    Ok(value)
}
