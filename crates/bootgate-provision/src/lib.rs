//! bootgate-provision: ephemeral test environments for bootgate.
//!
//! This crate is the provisioning layer. It defines the
//! [`ProvisionBackend`] seam the orchestrator talks to, plus:
//!
//! - [`LocalBackend`]: scratch directories on the orchestrating host
//! - [`CommandBackend`]: an external provisioner program (bootc, container)
//! - [`provision_with_retry`]: bounded retry with capped exponential backoff
//! - [`EnvironmentLease`]: scoped ownership with guaranteed teardown
//!
//! Every provisioned [`Environment`] is owned by exactly one job and must be
//! handed back to [`ProvisionBackend::teardown`] exactly once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bootgate_core::{Builder, ProvisioningSpec};
use serde::{Deserialize, Serialize};

pub mod command;
pub mod error;
pub mod fakes;
pub mod lease;
pub mod local;
pub mod retry;

pub use command::CommandBackend;
pub use error::{ProvisionError, ProvisionResult};
pub use lease::{with_environment, EnvironmentLease};
pub use local::LocalBackend;
pub use retry::{provision_with_retry, ProvisionFailure, Provisioned, RetryPolicy};

/// Handle to a running provisioned target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Environment {
    /// Backend-assigned identity, unique among live environments.
    pub id: String,
    pub builder: Builder,
    /// Host-visible filesystem root; steps run with this as working directory.
    pub root: PathBuf,
    /// Program prefix that executes a command inside the environment
    /// (e.g. `["ssh", "vm-3"]`). Empty means run directly on the host.
    #[serde(default)]
    pub exec_prefix: Vec<String>,
    /// Extra variables exported to every step.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.builder, self.id)
    }
}

/// A provisioning backend.
///
/// `provision` may be dropped mid-flight when a run is cancelled;
/// implementations should not leave resources behind in that case.
#[async_trait]
pub trait ProvisionBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Produce a running environment for `spec`.
    async fn provision(&self, spec: &ProvisioningSpec) -> ProvisionResult<Environment>;

    /// Destroy `env`. Called exactly once per provisioned environment.
    async fn teardown(&self, env: Environment) -> ProvisionResult<()>;
}

/// Builder identity to backend mapping.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<Builder, Arc<dyn ProvisionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `backend` for `builder`, replacing any previous registration.
    pub fn register(&mut self, builder: Builder, backend: Arc<dyn ProvisionBackend>) {
        self.backends.insert(builder, backend);
    }

    pub fn with_backend(mut self, builder: Builder, backend: Arc<dyn ProvisionBackend>) -> Self {
        self.register(builder, backend);
        self
    }

    /// Backend for `builder`; an unregistered builder is unavailable.
    pub fn get(&self, builder: Builder) -> ProvisionResult<Arc<dyn ProvisionBackend>> {
        self.backends
            .get(&builder)
            .cloned()
            .ok_or_else(|| ProvisionError::BuilderUnavailable {
                builder: builder.to_string(),
                reason: "no backend registered".to_string(),
            })
    }

    /// Registered builders, in declaration order of [`Builder::ALL`].
    pub fn builders(&self) -> Vec<Builder> {
        Builder::ALL
            .into_iter()
            .filter(|b| self.backends.contains_key(b))
            .collect()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("builders", &self.builders())
            .finish()
    }
}
