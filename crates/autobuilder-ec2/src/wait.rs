//! Resource polling with backoff, attempt limits and cancellation support.
//!
//! Every wait in the engine goes through [`wait_for_resource`]: instance
//! readiness (bounded by time), spot fulfilment (bounded by attempts) and
//! termination (unbounded). The check closure decides what "ready" means and
//! may hand a value back to the caller once it is.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for resource waiting.
///
/// A fixed polling interval is expressed by setting `initial_delay` equal to
/// `max_delay` with jitter disabled.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Initial delay between checks
    pub initial_delay: Duration,
    /// Maximum delay between checks (cap for exponential growth)
    pub max_delay: Duration,
    /// Maximum number of checks, `None` for no limit
    pub max_attempts: Option<u32>,
    /// Maximum total time to wait, `None` for no limit
    pub timeout: Option<Duration>,
    /// Randomize delays to spread out concurrent pollers
    pub jitter: bool,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: None,
            timeout: Some(Duration::from_secs(60)),
            jitter: true,
        }
    }
}

impl WaitConfig {
    /// Poll at a fixed interval, optionally bounded by an attempt count.
    pub fn fixed(interval: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            max_attempts,
            timeout: None,
            jitter: false,
        }
    }

    /// Exponential backoff between `initial` and `max`, bounded by `timeout`.
    pub fn backoff(initial: Duration, max: Duration, timeout: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_attempts: None,
            timeout: Some(timeout),
            jitter: true,
        }
    }
}

/// Why a wait ended without the resource becoming ready
#[derive(Debug, Error)]
pub enum WaitError {
    /// The time budget ran out
    #[error("Timeout waiting for {resource} after {elapsed:?} ({attempts} attempts)")]
    TimedOut {
        resource: String,
        elapsed: Duration,
        attempts: u32,
    },

    /// The attempt budget ran out
    #[error("Gave up waiting for {resource} after {attempts} attempts")]
    AttemptsExhausted { resource: String, attempts: u32 },

    /// The cancellation token fired
    #[error("Wait for {resource} cancelled")]
    Cancelled { resource: String },

    /// The check itself failed
    #[error("Check for {resource} failed: {source}")]
    Check {
        resource: String,
        #[source]
        source: anyhow::Error,
    },
}

impl WaitError {
    /// The wait ran out of time or attempts (as opposed to failing or being cancelled)
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            WaitError::TimedOut { .. } | WaitError::AttemptsExhausted { .. }
        )
    }
}

/// Wait for a resource to become ready.
///
/// Uses `backon::ExponentialBuilder` for delay calculation and `tokio::select!`
/// for cancellation support. Waits longer than a minute log progress once per
/// elapsed minute.
///
/// # Arguments
/// * `config` - Wait configuration
/// * `cancel` - Optional cancellation token
/// * `check` - Async function returning `Ok(Some(value))` when ready, `Ok(None)` to retry
/// * `resource_name` - Name for logging
///
/// # Example
/// ```ignore
/// let state = wait_for_resource(
///     WaitConfig::fixed(Duration::from_secs(5), Some(6)),
///     None,
///     || async { Ok(lookup_state().await?.filter(|s| s.is_ready())) },
///     "spot request sir-1234",
/// ).await?;
/// ```
pub async fn wait_for_resource<T, F, Fut>(
    config: WaitConfig,
    cancel: Option<&CancellationToken>,
    check: F,
    resource_name: &str,
) -> Result<T, WaitError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut logged_minutes = 0u64;

    let mut builder = ExponentialBuilder::default()
        .with_min_delay(config.initial_delay)
        .with_max_delay(config.max_delay)
        .with_factor(2.0);
    if config.jitter {
        builder = builder.with_jitter();
    }
    let mut delays = builder.build();

    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(WaitError::Cancelled {
                    resource: resource_name.to_string(),
                });
            }
        }

        if let Some(timeout) = config.timeout {
            if start.elapsed() >= timeout {
                return Err(WaitError::TimedOut {
                    resource: resource_name.to_string(),
                    elapsed: start.elapsed(),
                    attempts,
                });
            }
        }

        attempts += 1;

        match check().await {
            Ok(Some(value)) => {
                debug!(resource = %resource_name, attempts, "Resource ready");
                return Ok(value);
            }
            Ok(None) => {
                if config.max_attempts.is_some_and(|max| attempts >= max) {
                    return Err(WaitError::AttemptsExhausted {
                        resource: resource_name.to_string(),
                        attempts,
                    });
                }

                let minutes = start.elapsed().as_secs() / 60;
                if minutes > logged_minutes {
                    logged_minutes = minutes;
                    info!(
                        resource = %resource_name,
                        minutes,
                        attempts,
                        "Still waiting"
                    );
                }

                let delay = delays.next().unwrap_or(config.max_delay);
                debug!(
                    resource = %resource_name,
                    attempt = attempts,
                    delay_ms = delay.as_millis(),
                    "Resource not ready, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = async {
                        if let Some(token) = cancel {
                            token.cancelled().await
                        } else {
                            std::future::pending::<()>().await
                        }
                    } => {
                        return Err(WaitError::Cancelled {
                            resource: resource_name.to_string(),
                        });
                    }
                }
            }
            Err(e) => {
                warn!(resource = %resource_name, error = ?e, "Resource check failed");
                return Err(WaitError::Check {
                    resource: resource_name.to_string(),
                    source: e,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_ready() {
        let calls = AtomicU32::new(0);
        let value = wait_for_resource(
            WaitConfig::fixed(Duration::from_secs(5), None),
            None,
            || {
                let calls = &calls;
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((n == 3).then_some(n))
                }
            },
            "counter",
        )
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = wait_for_resource::<(), _, _>(
            WaitConfig::fixed(Duration::from_secs(5), Some(6)),
            None,
            || {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            },
            "never",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WaitError::AttemptsExhausted { attempts: 6, .. }));
        assert!(err.is_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let err = wait_for_resource::<(), _, _>(
            WaitConfig::backoff(
                Duration::from_secs(2),
                Duration::from_secs(15),
                Duration::from_secs(60),
            ),
            None,
            || async { Ok(None) },
            "slow",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WaitError::TimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn check_error_is_propagated() {
        let err = wait_for_resource::<(), _, _>(
            WaitConfig::default(),
            None,
            || async { Err(anyhow::anyhow!("boom")) },
            "broken",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WaitError::Check { .. }));
        assert!(!err.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_wait() {
        let token = CancellationToken::new();
        token.cancel();
        let err = wait_for_resource::<(), _, _>(
            WaitConfig::fixed(Duration::from_secs(1), None),
            Some(&token),
            || async { Ok(None) },
            "cancelled",
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WaitError::Cancelled { .. }));
    }
}
