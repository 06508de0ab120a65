//! One job: resolve its plan, provision, run the scripts, tear down.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bootgate_core::{
    resolve_path, ExecutionMode, ExecutionPlan, FailureDetail, FailureKind, GateError, JobSpec,
    Outcome, Report, ReportEntry,
};
use bootgate_provision::{
    provision_with_retry, with_environment, BackendRegistry, EnvironmentLease, ProvisionError,
    RetryPolicy,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::output::{StepObserver, TracingObserver};
use crate::runner::ScriptRunner;

/// Terminal result of one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobReport {
    pub job: String,
    pub outcome: Outcome,
    /// Per-step report, present when scripts ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Report>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub provision_attempts: u32,
    /// Set when the environment could not be torn down cleanly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teardown_error: Option<String>,
    pub duration_ms: u64,
    pub blocking: bool,
}

impl JobReport {
    /// Report for a job that ended without running anything.
    pub fn new(job: &JobSpec, outcome: Outcome) -> Self {
        Self {
            job: job.name.clone(),
            outcome,
            steps: None,
            plan_digest: None,
            environment: None,
            provision_attempts: 0,
            teardown_error: None,
            duration_ms: 0,
            blocking: job.blocking,
        }
    }

    pub fn skipped(job: &JobSpec, reason: impl Into<String>) -> Self {
        Self::new(job, Outcome::skipped(reason))
    }

    /// Summary entry for the run-level report.
    pub fn entry(&self) -> ReportEntry {
        let entry = ReportEntry::new(self.job.clone(), self.outcome.clone(), self.duration_ms);
        if self.blocking {
            entry
        } else {
            entry.non_blocking()
        }
    }
}

/// Executes individual jobs for the graph executor.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Validate `job` before anything in the run is provisioned.
    async fn preflight(&self, job: &JobSpec) -> Result<(), GateError>;

    /// Run `job` to a terminal outcome. Must return promptly once `cancel`
    /// fires, with all resources released.
    async fn run_job(&self, job: &JobSpec, cancel: CancellationToken) -> JobReport;
}

/// The production [`JobRunner`]: plan, provision with retry, run, teardown.
pub struct PlanJobRunner {
    registry: BackendRegistry,
    runner: ScriptRunner,
    retry: RetryPolicy,
    mode: Option<ExecutionMode>,
    observer: Arc<dyn StepObserver>,
}

impl PlanJobRunner {
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            runner: ScriptRunner::default(),
            retry: RetryPolicy::default(),
            mode: None,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_runner(mut self, runner: ScriptRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the execution mode declared by every plan.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Resolve the plan for `job`, applying the mode override.
    ///
    /// Every call reads the plan and its scripts from disk again; a plan lives
    /// for one job invocation only.
    pub fn resolve(&self, job: &JobSpec) -> Result<ExecutionPlan, GateError> {
        let path = job.plan.as_ref().ok_or_else(|| {
            GateError::MalformedPlan(format!("job '{}' declares no plan", job.name))
        })?;
        let plan = resolve_path(path)?;
        match self.mode {
            Some(mode) => plan.with_mode(mode),
            None => Ok(plan),
        }
    }
}

fn provision_outcome(error: &ProvisionError) -> Outcome {
    match error {
        ProvisionError::Cancelled => Outcome::Cancelled,
        other => Outcome::failed(FailureDetail::new(FailureKind::Provision, other.to_string())),
    }
}

#[async_trait]
impl JobRunner for PlanJobRunner {
    async fn preflight(&self, job: &JobSpec) -> Result<(), GateError> {
        self.resolve(job).map(|_| ())
    }

    async fn run_job(&self, job: &JobSpec, cancel: CancellationToken) -> JobReport {
        let start = Instant::now();
        let mut report = JobReport::new(job, Outcome::Passed);

        let plan = match self.resolve(job) {
            Ok(plan) => plan,
            Err(err) => {
                report.outcome = Outcome::failed(FailureDetail::new(
                    FailureKind::Configuration,
                    err.to_string(),
                ));
                report.duration_ms = start.elapsed().as_millis() as u64;
                return report;
            }
        };
        report.plan_digest = Some(plan.digest().to_string());

        let provisioned = match self.registry.get(plan.provisioning().builder) {
            Ok(backend) => {
                match provision_with_retry(backend.as_ref(), plan.provisioning(), &self.retry, &cancel).await {
                    Ok(provisioned) => Ok((backend, provisioned)),
                    Err(failure) => {
                        report.provision_attempts = failure.attempts;
                        Err(failure.error)
                    }
                }
            }
            Err(err) => Err(err),
        };

        let (backend, provisioned) = match provisioned {
            Ok(ok) => ok,
            Err(err) => {
                warn!(job = %job.name, error = %err, "Provisioning failed");
                report.outcome = provision_outcome(&err);
                report.duration_ms = start.elapsed().as_millis() as u64;
                return report;
            }
        };
        report.provision_attempts = provisioned.attempts;
        report.environment = Some(provisioned.environment.to_string());
        info!(job = %job.name, env = %provisioned.environment, attempts = provisioned.attempts, "Environment ready");

        let lease = EnvironmentLease::new(backend, provisioned.environment);
        let runner = &self.runner;
        let observer = self.observer.as_ref();
        let plan_ref = &plan;
        let cancel_ref = &cancel;
        let (steps, teardown) = with_environment(lease, |env| async move {
            runner
                .run(&job.name, plan_ref, &env, observer, cancel_ref)
                .await
        })
        .await;

        if let Err(err) = teardown {
            report.teardown_error = Some(err.to_string());
        }
        report.outcome = steps.overall();
        report.steps = Some(steps);
        report.duration_ms = start.elapsed().as_millis() as u64;
        report
    }
}
