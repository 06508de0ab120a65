//! bootgate core: the domain layer of the bootgate CI orchestrator.
//!
//! Provides:
//! - Domain types (`ExecutionPlan`, `JobSpec`, `TriggerEvent`, `Outcome`, `Report`)
//! - The plan resolver (YAML plan documents to immutable execution plans)
//! - The gating policy engine (trigger, label and branch predicates)

pub mod domain;
pub mod policy;
pub mod resolver;
pub mod telemetry;

pub use domain::{
    numeric_prefix, Builder, ErrorClass, ExecutionMode, ExecutionPlan, FailureDetail,
    FailureKind, FinalVerdict, GateError, JobGraphDocument, JobSpec, LabelPolicy, Outcome,
    OutcomeCounts, ProvisioningSpec, Report, ReportEntry, Result, ScriptStep, StepSource,
    TriggerEvent, TriggerKind, SKIP_CANCELLED, SKIP_DEPENDENCY_FAILED, SKIP_DEPENDENCY_SKIPPED,
    SKIP_UPSTREAM_FAILURE,
};
pub use policy::{admit, Admission, BranchFilter, GatingPolicy};
pub use resolver::{discover_steps, load_job_graph, resolve, resolve_path, PlanDocument};
pub use telemetry::init_tracing;

/// bootgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
