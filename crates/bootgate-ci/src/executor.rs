//! Job graph execution.
//!
//! Every job becomes its own task. A task waits on its dependencies'
//! settle signals, then on a parallelism permit, then runs the job through
//! the [`JobRunner`]. Its report goes to the [`ReportStore`] before the
//! task signals dependents, so the store always holds the outcome that
//! dependents reacted to.
//!
//! Cancellation tokens form a tree: run → concurrency group → job. Each job
//! additionally has a handle-level token so [`RunHandle::cancel_job`] can
//! stop a single job.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bootgate_core::{
    Admission, FailureDetail, FailureKind, GateError, GatingPolicy, JobSpec, Outcome, Report,
    TriggerEvent, SKIP_CANCELLED, SKIP_DEPENDENCY_FAILED, SKIP_DEPENDENCY_SKIPPED,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::concurrency::{ConcurrencyGroups, GroupClaim};
use crate::graph::JobGraph;
use crate::job::{JobReport, JobRunner};
use crate::reporting::RunReport;
use crate::store::{MemoryReportStore, ReportStore};

/// Default number of jobs running at once.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running jobs (minimum 1).
    pub max_parallel: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }
}

/// Errors from a spawned run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] GateError),

    #[error("run task aborted")]
    Aborted,
}

/// What a settled job means for its dependents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Passed,
    /// Dependents are skipped with this reason.
    Blocked(&'static str),
}

impl Settled {
    fn of(report: &JobReport, gated: bool) -> Self {
        match &report.outcome {
            Outcome::Passed => Settled::Passed,
            Outcome::Failed(_) => Settled::Blocked(SKIP_DEPENDENCY_FAILED),
            Outcome::Cancelled => Settled::Blocked(SKIP_CANCELLED),
            Outcome::Skipped { .. } if gated => Settled::Blocked(SKIP_DEPENDENCY_SKIPPED),
            Outcome::Skipped { reason } => Settled::Blocked(inherited_reason(reason)),
        }
    }
}

fn inherited_reason(reason: &str) -> &'static str {
    match reason {
        SKIP_DEPENDENCY_FAILED => SKIP_DEPENDENCY_FAILED,
        SKIP_CANCELLED => SKIP_CANCELLED,
        _ => SKIP_DEPENDENCY_SKIPPED,
    }
}

/// Skip reason for a job given its settled dependencies.
/// Failure outranks cancellation, which outranks a plain skip.
fn blocking_reason(dependencies: &[Settled]) -> Option<&'static str> {
    let rank = |reason: &str| match reason {
        SKIP_DEPENDENCY_FAILED => 0,
        SKIP_CANCELLED => 1,
        _ => 2,
    };
    dependencies
        .iter()
        .filter_map(|s| match s {
            Settled::Passed => None,
            Settled::Blocked(reason) => Some(*reason),
        })
        .min_by_key(|reason| rank(reason))
}

/// Runs job graphs.
#[derive(Clone)]
pub struct GraphExecutor {
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn ReportStore>,
    groups: ConcurrencyGroups,
    config: ExecutorConfig,
}

impl GraphExecutor {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            store: Arc::new(MemoryReportStore::new()),
            groups: ConcurrencyGroups::new(),
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ReportStore>) -> Self {
        self.store = store;
        self
    }

    /// Share concurrency groups with other executors.
    pub fn with_groups(mut self, groups: ConcurrencyGroups) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn groups(&self) -> &ConcurrencyGroups {
        &self.groups
    }

    /// Run `jobs` for `event` to completion.
    pub async fn execute(&self, jobs: Vec<JobSpec>, event: &TriggerEvent) -> Result<RunReport, GateError> {
        self.execute_with_cancel(jobs, event, CancellationToken::new())
            .await
    }

    /// Run `jobs` for `event`; cancelling `cancel` cancels the whole run.
    pub async fn execute_with_cancel(
        &self,
        jobs: Vec<JobSpec>,
        event: &TriggerEvent,
        cancel: CancellationToken,
    ) -> Result<RunReport, GateError> {
        let tokens = Arc::new(job_tokens(&jobs, &cancel));
        self.run(new_run_id(), jobs, event.clone(), cancel, tokens)
            .await
    }

    /// Start a run in the background.
    pub fn spawn(&self, jobs: Vec<JobSpec>, event: TriggerEvent) -> RunHandle {
        let cancel = CancellationToken::new();
        let tokens = Arc::new(job_tokens(&jobs, &cancel));
        let run_id = new_run_id();
        let executor = self.clone();
        let join = tokio::spawn({
            let cancel = cancel.clone();
            let tokens = Arc::clone(&tokens);
            let run_id = run_id.clone();
            async move { executor.run(run_id, jobs, event, cancel, tokens).await }
        });
        RunHandle {
            run_id,
            cancel,
            tokens,
            join,
        }
    }

    async fn run(
        &self,
        run_id: String,
        specs: Vec<JobSpec>,
        event: TriggerEvent,
        cancel: CancellationToken,
        tokens: Arc<HashMap<String, CancellationToken>>,
    ) -> Result<RunReport, GateError> {
        let started_at = Utc::now();
        let graph = JobGraph::new(specs)?;
        info!(
            run_id = %run_id,
            trigger = %event.kind,
            git_ref = %event.git_ref,
            jobs = graph.len(),
            "Starting job graph"
        );

        let mut admissions: HashMap<String, Admission> = HashMap::new();
        for job in graph.jobs() {
            let decision = GatingPolicy::for_job(job)?.admit(&event, &event.labels);
            if let Admission::Skip(reason) = &decision {
                info!(run_id = %run_id, job = %job.name, reason = %reason, "Job not admitted");
            }
            admissions.insert(job.name.clone(), decision);
        }

        for job in graph.jobs() {
            if admissions.get(&job.name).is_some_and(Admission::is_admitted) {
                if let Err(err) = self.runner.preflight(job).await {
                    warn!(run_id = %run_id, job = %job.name, error = %err, "Preflight failed");
                    return Err(err);
                }
            }
        }

        let keys: BTreeSet<String> = graph
            .jobs()
            .filter(|job| admissions.get(&job.name).is_some_and(Admission::is_admitted))
            .filter_map(|job| job.concurrency_key(&event))
            .collect();
        let mut claims: HashMap<String, Arc<GroupClaim>> = HashMap::new();
        for key in keys {
            if self.groups.is_held(&key) {
                info!(run_id = %run_id, group = %key, "Concurrency group busy, superseding");
            }
            tokio::select! {
                claim = self.groups.claim(&key, &cancel) => {
                    claims.insert(key, Arc::new(claim));
                }
                _ = cancel.cancelled() => break,
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for job in graph.jobs() {
            let (tx, rx) = watch::channel(None);
            senders.insert(job.name.clone(), tx);
            receivers.insert(job.name.clone(), rx);
        }

        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(graph.len());
        for name in graph.topological_order() {
            let (Some(job), Some(settled)) = (graph.get(&name).cloned(), senders.remove(&name)) else {
                continue;
            };
            let dependencies = job
                .needs
                .iter()
                .filter_map(|dep| receivers.get(dep).cloned())
                .collect();
            let node = JobNode {
                run_id: run_id.clone(),
                admission: admissions.remove(&name).unwrap_or(Admission::Admit),
                claim: job.concurrency_key(&event).and_then(|key| claims.get(&key).cloned()),
                token: tokens
                    .get(&name)
                    .cloned()
                    .unwrap_or_else(|| cancel.child_token()),
                cancel: cancel.clone(),
                dependencies,
                settled,
                runner: Arc::clone(&self.runner),
                store: Arc::clone(&self.store),
                semaphore: Arc::clone(&semaphore),
                job,
            };
            handles.push((name, tokio::spawn(node.run())));
        }
        drop(claims);
        drop(receivers);

        for (name, handle) in handles {
            if let Err(err) = handle.await {
                error!(run_id = %run_id, job = %name, error = %err, "Job task failed");
                if self.store.get(&run_id, &name).await.is_some() {
                    continue;
                }
                if let Some(job) = graph.get(&name) {
                    let report = JobReport::new(
                        job,
                        Outcome::failed(FailureDetail::new(
                            FailureKind::Runner,
                            format!("job task failed: {}", err),
                        )),
                    );
                    if let Err(err) = self.store.put(&run_id, report).await {
                        warn!(run_id = %run_id, job = %name, error = %err, "Report already stored");
                    }
                }
            }
        }

        let stored = self.store.list(&run_id).await;
        let mut summary = Report::new(run_id.clone());
        let mut jobs = Vec::with_capacity(graph.len());
        for job in graph.jobs() {
            let report = stored
                .iter()
                .find(|r| r.job == job.name)
                .cloned()
                .unwrap_or_else(|| {
                    JobReport::new(
                        job,
                        Outcome::failed(FailureDetail::new(FailureKind::Runner, "no report recorded")),
                    )
                });
            summary.record(report.entry())?;
            jobs.push(report);
        }

        let verdict = summary.verdict();
        let counts = summary.counts();
        info!(
            run_id = %run_id,
            verdict = %verdict,
            passed = counts.passed,
            failed = counts.failed,
            skipped = counts.skipped,
            cancelled = counts.cancelled,
            "Job graph finished"
        );

        Ok(RunReport {
            run_id,
            trigger: event,
            verdict,
            summary,
            jobs,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

fn job_tokens(jobs: &[JobSpec], cancel: &CancellationToken) -> HashMap<String, CancellationToken> {
    jobs.iter()
        .map(|job| (job.name.clone(), cancel.child_token()))
        .collect()
}

/// One job's task state.
struct JobNode {
    run_id: String,
    job: JobSpec,
    admission: Admission,
    claim: Option<Arc<GroupClaim>>,
    /// Handle-level token for this job (child of the run token).
    token: CancellationToken,
    cancel: CancellationToken,
    dependencies: Vec<watch::Receiver<Option<Settled>>>,
    settled: watch::Sender<Option<Settled>>,
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn ReportStore>,
    semaphore: Arc<Semaphore>,
}

impl JobNode {
    async fn run(mut self) {
        let gated = !self.admission.is_admitted();
        let report = self.drive().await;
        let settled = Settled::of(&report, gated);
        let outcome = report.outcome.label();
        if let Err(err) = self.store.put(&self.run_id, report).await {
            warn!(run_id = %self.run_id, job = %self.job.name, error = %err, "Report already stored");
        }
        info!(run_id = %self.run_id, job = %self.job.name, outcome, "Job settled");
        self.settled.send_replace(Some(settled));
    }

    async fn drive(&mut self) -> JobReport {
        if let Admission::Skip(reason) = &self.admission {
            return JobReport::skipped(&self.job, reason.clone());
        }

        // Superseded groups and run-level cancellation both flow into this.
        let effective = match &self.claim {
            Some(claim) => claim.token().child_token(),
            None => self.cancel.child_token(),
        };

        let dependencies = std::mem::take(&mut self.dependencies);
        let settled = tokio::select! {
            biased;
            _ = self.token.cancelled() => return JobReport::new(&self.job, Outcome::Cancelled),
            _ = effective.cancelled() => return JobReport::new(&self.job, Outcome::Cancelled),
            settled = wait_all(dependencies) => settled,
        };
        if let Some(reason) = blocking_reason(&settled) {
            info!(run_id = %self.run_id, job = %self.job.name, reason, "Skipping job");
            return JobReport::skipped(&self.job, reason);
        }

        let permit = tokio::select! {
            biased;
            _ = self.token.cancelled() => return JobReport::new(&self.job, Outcome::Cancelled),
            _ = effective.cancelled() => return JobReport::new(&self.job, Outcome::Cancelled),
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return JobReport::new(&self.job, Outcome::Cancelled);
        };

        info!(run_id = %self.run_id, job = %self.job.name, "Starting job");
        let job = self.runner.run_job(&self.job, effective.clone());
        tokio::pin!(job);
        tokio::select! {
            report = &mut job => report,
            _ = self.token.cancelled() => {
                effective.cancel();
                job.await
            }
        }
    }
}

async fn wait_all(dependencies: Vec<watch::Receiver<Option<Settled>>>) -> Vec<Settled> {
    let mut settled = Vec::with_capacity(dependencies.len());
    for mut rx in dependencies {
        let value = match rx.wait_for(Option::is_some).await {
            Ok(value) => *value,
            Err(_) => None,
        };
        settled.push(value.unwrap_or(Settled::Blocked(SKIP_DEPENDENCY_FAILED)));
    }
    settled
}

/// Control handle for a run started with [`GraphExecutor::spawn`].
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    tokens: Arc<HashMap<String, CancellationToken>>,
    join: JoinHandle<Result<RunReport, GateError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Cancel every job in the run. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel one job. Returns `false` for unknown names; a no-op for jobs
    /// that already finished.
    pub fn cancel_job(&self, name: &str) -> bool {
        match self.tokens.get(name) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunReport, RunError> {
        match self.join.await {
            Ok(result) => result.map_err(RunError::from),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(RunError::Aborted),
        }
    }
}
