//! Error types for bootgate-provision

use bootgate_core::ErrorClass;
use thiserror::Error;

/// Errors a provisioning backend can report.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// No backend registered for the builder, or the builder refused work.
    #[error("builder '{builder}' unavailable: {reason}")]
    BuilderUnavailable { builder: String, reason: String },

    /// The requested disk does not fit.
    #[error("insufficient disk: requested {requested_gib} GiB ({detail})")]
    InsufficientDisk { requested_gib: u64, detail: String },

    /// The builder ran but produced no usable environment.
    #[error("build failed: {0}")]
    BuildFailed(String),

    /// Provisioning was interrupted by cancellation.
    #[error("provisioning cancelled")]
    Cancelled,

    /// Tearing an environment down failed. The environment may have leaked.
    #[error("teardown of environment '{id}' failed: {reason}")]
    Teardown { id: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProvisionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ProvisionError::Cancelled => ErrorClass::Cancelled,
            _ => ErrorClass::Provisioning,
        }
    }

    /// Whether a later attempt may succeed. Disk exhaustion is deterministic
    /// for a fixed request and is never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProvisionError::BuilderUnavailable { .. } | ProvisionError::BuildFailed(_)
        )
    }
}

pub type ProvisionResult<T> = std::result::Result<T, ProvisionError>;
