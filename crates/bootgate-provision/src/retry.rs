//! Bounded provisioning retry with capped exponential backoff.

use std::time::Duration;

use bootgate_core::ProvisioningSpec;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ProvisionError;
use crate::{Environment, ProvisionBackend};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default backoff before the first retry (milliseconds).
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
/// Default upper bound on a single backoff (milliseconds).
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

/// Retry bounds for provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = run once).
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries (milliseconds).
    pub backoff_base_ms: u64,
    /// Cap on any single delay (milliseconds).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }
}

/// A successfully provisioned environment and how many attempts it took.
#[derive(Debug)]
pub struct Provisioned {
    pub environment: Environment,
    pub attempts: u32,
}

/// The error that ended provisioning, with the attempts spent.
#[derive(Debug, thiserror::Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct ProvisionFailure {
    #[source]
    pub error: ProvisionError,
    pub attempts: u32,
}

/// Provision through `backend`, retrying transient failures per `policy`.
///
/// Cancellation interrupts both an in-flight attempt and the backoff sleep.
pub async fn provision_with_retry(
    backend: &dyn ProvisionBackend,
    spec: &ProvisioningSpec,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Provisioned, ProvisionFailure> {
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(ProvisionFailure {
                error: ProvisionError::Cancelled,
                attempts: attempt,
            });
        }
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProvisionError::Cancelled),
            result = backend.provision(spec) => result,
        };

        match result {
            Ok(environment) => {
                if attempt > 1 {
                    info!(backend = backend.name(), attempt, "provisioning succeeded after retry");
                }
                return Ok(Provisioned {
                    environment,
                    attempts: attempt,
                });
            }
            Err(error) if error.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    backend = backend.name(),
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "provisioning failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(ProvisionFailure {
                            error: ProvisionError::Cancelled,
                            attempts: attempt,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => {
                warn!(backend = backend.name(), attempt, error = %error, "provisioning failed");
                return Err(ProvisionFailure {
                    error,
                    attempts: attempt,
                });
            }
        }
    }
}
