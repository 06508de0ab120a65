//! Error taxonomy for plan resolution, graph validation and reporting.

use std::path::PathBuf;

/// Coarse error class used to pick retry behaviour and process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed plan, cyclic job graph, empty script discovery.
    Configuration,
    /// The provisioning backend could not produce an environment.
    Provisioning,
    /// A script exited non-zero or timed out.
    TestFailure,
    /// The run (or a job in it) was cancelled.
    Cancelled,
    /// A broken internal invariant.
    Internal,
}

impl ErrorClass {
    /// Process exit code for this class.
    ///
    /// | Code | Meaning                 |
    /// |------|-------------------------|
    /// | 1    | Test failure / internal |
    /// | 2    | Configuration error     |
    /// | 3    | Provisioning failure    |
    /// | 130  | Cancelled               |
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorClass::TestFailure | ErrorClass::Internal => 1,
            ErrorClass::Configuration => 2,
            ErrorClass::Provisioning => 3,
            ErrorClass::Cancelled => 130,
        }
    }

    /// Whether errors of this class may be retried by the orchestrator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::Provisioning)
    }
}

/// Errors produced by the bootgate domain layer.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    #[error("no scripts found matching '{pattern}' in {}", dir.display())]
    NoScriptsFound { dir: PathBuf, pattern: String },

    #[error("cyclic job dependency involving: {jobs:?}")]
    CyclicDependency { jobs: Vec<String> },

    #[error("job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("outcome for '{name}' already recorded in report '{subject}'")]
    OutcomeAlreadyRecorded { subject: String, name: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid document {}: {source}", path.display())]
    Document {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GateError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            GateError::OutcomeAlreadyRecorded { .. } | GateError::Serialization(_) => {
                ErrorClass::Internal
            }
            _ => ErrorClass::Configuration,
        }
    }
}

/// Result type for bootgate domain operations.
pub type Result<T> = std::result::Result<T, GateError>;
