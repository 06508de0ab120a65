//! `how: local` backend: a scratch directory per environment.
//!
//! Disk capacity is accounted across all live environments of one backend,
//! so concurrent jobs share the configured budget.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use bootgate_core::{Builder, ProvisioningSpec};
use tracing::{debug, info};

use crate::error::{ProvisionError, ProvisionResult};
use crate::{Environment, ProvisionBackend};

/// Default capacity in GiB for the local backend.
pub const DEFAULT_LOCAL_CAPACITY_GIB: u64 = 64;

#[derive(Debug)]
pub struct LocalBackend {
    base: PathBuf,
    capacity_gib: u64,
    /// Live environment id -> reserved GiB.
    reserved: Mutex<BTreeMap<String, u64>>,
}

impl LocalBackend {
    pub fn new(base: impl Into<PathBuf>, capacity_gib: u64) -> Self {
        Self {
            base: base.into(),
            capacity_gib,
            reserved: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// GiB still available for new environments.
    pub fn available_gib(&self) -> u64 {
        let reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        self.capacity_gib.saturating_sub(reserved.values().sum())
    }

    fn reserve(&self, id: &str, gib: u64) -> ProvisionResult<Reservation<'_>> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        let available = self.capacity_gib.saturating_sub(reserved.values().sum());
        if gib > available {
            return Err(ProvisionError::InsufficientDisk {
                requested_gib: gib,
                detail: format!("{} of {} GiB available", available, self.capacity_gib),
            });
        }
        reserved.insert(id.to_string(), gib);
        Ok(Reservation {
            backend: self,
            id: id.to_string(),
            committed: false,
        })
    }

    fn unreserve(&self, id: &str) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.remove(id);
    }
}

/// Capacity held for an environment that is still being created.
///
/// Dropped without [`Reservation::commit`], e.g. when the provisioning future
/// is abandoned mid-await, the capacity goes back to the backend.
struct Reservation<'a> {
    backend: &'a LocalBackend,
    id: String,
    committed: bool,
}

impl Reservation<'_> {
    /// Hand the capacity over to the live environment; teardown releases it.
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(env = %self.id, "releasing uncommitted capacity");
            self.backend.unreserve(&self.id);
        }
    }
}

#[async_trait]
impl ProvisionBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn provision(&self, spec: &ProvisioningSpec) -> ProvisionResult<Environment> {
        let id = format!("local-{}", uuid::Uuid::new_v4().simple());
        let reservation = self.reserve(&id, spec.disk_gib)?;

        let root = self.base.join(&id);
        if let Err(err) = tokio::fs::create_dir_all(&root).await {
            return Err(ProvisionError::BuildFailed(format!(
                "cannot create {}: {}",
                root.display(),
                err
            )));
        }

        let mut env = BTreeMap::new();
        env.insert(
            "BOOTGATE_CONTEXT".to_string(),
            spec.context.to_string_lossy().into_owned(),
        );
        if let Some(workdir) = &spec.workdir {
            env.insert(
                "BOOTGATE_WORKDIR".to_string(),
                spec.context.join(workdir).to_string_lossy().into_owned(),
            );
        }

        reservation.commit();
        info!(env = %id, root = %root.display(), disk_gib = spec.disk_gib, "provisioned local environment");
        Ok(Environment {
            id,
            builder: Builder::Local,
            root,
            exec_prefix: Vec::new(),
            env,
        })
    }

    async fn teardown(&self, env: Environment) -> ProvisionResult<()> {
        self.unreserve(&env.id);
        match tokio::fs::remove_dir_all(&env.root).await {
            Ok(()) => {
                debug!(env = %env.id, "removed local environment");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ProvisionError::Teardown {
                id: env.id,
                reason: err.to_string(),
            }),
        }
    }
}
