//! Scoped environment ownership.
//!
//! An [`EnvironmentLease`] tears its environment down exactly once: through
//! [`EnvironmentLease::release`] on the normal path, or from `Drop` when the
//! owning task unwinds or is aborted before releasing.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::error::ProvisionResult;
use crate::{Environment, ProvisionBackend};

pub struct EnvironmentLease {
    backend: Arc<dyn ProvisionBackend>,
    environment: Environment,
    released: bool,
}

impl EnvironmentLease {
    pub fn new(backend: Arc<dyn ProvisionBackend>, environment: Environment) -> Self {
        Self {
            backend,
            environment,
            released: false,
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Tear the environment down now.
    pub async fn release(mut self) -> ProvisionResult<()> {
        self.released = true;
        let id = self.environment.id.clone();
        let result = self.backend.teardown(self.environment.clone()).await;
        match &result {
            Ok(()) => debug!(env = %id, "environment released"),
            Err(err) => warn!(env = %id, error = %err, "environment teardown failed"),
        }
        result
    }
}

impl std::fmt::Debug for EnvironmentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentLease")
            .field("backend", &self.backend.name())
            .field("environment", &self.environment)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let backend = Arc::clone(&self.backend);
        let environment = self.environment.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(env = %environment.id, "lease dropped without release, scheduling teardown");
                handle.spawn(async move {
                    let id = environment.id.clone();
                    if let Err(err) = backend.teardown(environment).await {
                        error!(env = %id, error = %err, "deferred teardown failed");
                    }
                });
            }
            Err(_) => {
                error!(env = %environment.id, "lease dropped outside a runtime, environment leaked");
            }
        }
    }
}

/// Run `f` against the leased environment, then release it.
///
/// Release happens on every exit path: a panic inside `f` is caught, the
/// environment is torn down, and the panic is resumed. Returns `f`'s value
/// together with the teardown result.
pub async fn with_environment<F, Fut, T>(lease: EnvironmentLease, f: F) -> (T, ProvisionResult<()>)
where
    F: FnOnce(Environment) -> Fut,
    Fut: Future<Output = T>,
{
    let result = AssertUnwindSafe(f(lease.environment().clone()))
        .catch_unwind()
        .await;
    let teardown = lease.release().await;
    match result {
        Ok(value) => (value, teardown),
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
