//! Domain models for bootgate.
//!
//! Canonical definitions for the core entities:
//! - `ExecutionPlan`: resolved provisioning request plus ordered script steps
//! - `JobSpec` / `TriggerEvent`: what CI runs and why
//! - `Outcome` / `Report`: terminal results and their aggregation

pub mod digest;
pub mod error;
pub mod job;
pub mod outcome;
pub mod plan;

pub use error::{ErrorClass, GateError, Result};
pub use job::{JobGraphDocument, JobSpec, LabelPolicy, TriggerEvent, TriggerKind};
pub use outcome::{
    FailureDetail, FailureKind, FinalVerdict, Outcome, OutcomeCounts, Report, ReportEntry,
    SKIP_CANCELLED, SKIP_DEPENDENCY_FAILED, SKIP_DEPENDENCY_SKIPPED, SKIP_UPSTREAM_FAILURE,
};
pub use plan::{
    numeric_prefix, Builder, ExecutionMode, ExecutionPlan, ProvisioningSpec, ScriptStep,
    StepSource,
};
