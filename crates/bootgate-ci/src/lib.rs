//! bootgate CI - test plan orchestration
//!
//! Provides the orchestration layer on top of `bootgate-core` and
//! `bootgate-provision`:
//! - Runs ordered test scripts inside a provisioned environment
//! - Executes the CI job graph with gating, dependencies, bounded
//!   parallelism and concurrency-group cancellation
//! - Aggregates outcomes into a run report and merge-gate verdict

pub mod concurrency;
pub mod executor;
pub mod graph;
pub mod job;
pub mod output;
pub mod reporting;
pub mod runner;
pub mod store;

// Re-export key types
pub use concurrency::{ConcurrencyGroups, GroupClaim};
pub use executor::{ExecutorConfig, GraphExecutor, RunError, RunHandle, DEFAULT_MAX_PARALLEL};
pub use graph::JobGraph;
pub use job::{JobReport, JobRunner, PlanJobRunner};
pub use output::{OutputTail, StepObserver, Stream, TracingObserver};
pub use reporting::{render_run_summary_md, write_run_report_json, RunReport};
pub use runner::{RunnerConfig, ScriptRunner};
pub use store::{MemoryReportStore, ReportStore, StoreError};
