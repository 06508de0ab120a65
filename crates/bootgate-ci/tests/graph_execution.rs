//! Job graph execution: propagation, gating, cancellation and groups.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bootgate_ci::{
    ExecutorConfig, GraphExecutor, JobReport, JobRunner, PlanJobRunner, RunnerConfig, ScriptRunner,
};
use bootgate_core::{
    Builder, FailureDetail, FailureKind, FinalVerdict, GateError, JobSpec, Outcome, TriggerEvent,
    SKIP_CANCELLED, SKIP_DEPENDENCY_FAILED, SKIP_DEPENDENCY_SKIPPED,
};
use bootgate_provision::fakes::{BackendEvent, RecordingBackend};
use bootgate_provision::{BackendRegistry, RetryPolicy};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

/// Runner that returns canned outcomes after a delay and records calls.
#[derive(Default)]
struct FakeRunner {
    failing: Vec<String>,
    invalid: Vec<String>,
    panicking: Vec<String>,
    delays: HashMap<String, Duration>,
    calls: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    fn failing(mut self, job: &str) -> Self {
        self.failing.push(job.to_string());
        self
    }

    fn invalid(mut self, job: &str) -> Self {
        self.invalid.push(job.to_string());
        self
    }

    fn panicking(mut self, job: &str) -> Self {
        self.panicking.push(job.to_string());
        self
    }

    fn delay(mut self, job: &str, delay: Duration) -> Self {
        self.delays.insert(job.to_string(), delay);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobRunner for FakeRunner {
    async fn preflight(&self, job: &JobSpec) -> Result<(), GateError> {
        if self.invalid.contains(&job.name) {
            return Err(GateError::MalformedPlan(format!("{} is broken", job.name)));
        }
        Ok(())
    }

    async fn run_job(&self, job: &JobSpec, cancel: CancellationToken) -> JobReport {
        self.calls.lock().unwrap().push(job.name.clone());
        if self.panicking.contains(&job.name) {
            panic!("{} crashed", job.name);
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.get(&job.name).copied().unwrap_or(Duration::from_millis(20));
        let outcome = tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if self.failing.contains(&job.name) {
                    Outcome::failed(FailureDetail::exit(1, vec!["assertion failed".to_string()]))
                } else {
                    Outcome::Passed
                }
            }
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        JobReport::new(job, outcome)
    }
}

fn executor(runner: Arc<FakeRunner>) -> GraphExecutor {
    GraphExecutor::new(runner)
}

async fn wait_for_call(runner: &FakeRunner, job: &str) {
    while !runner.calls().iter().any(|c| c == job) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn failure_skips_transitive_dependents() {
    let runner = Arc::new(FakeRunner::default().failing("build"));
    let jobs = vec![
        JobSpec::new("build"),
        JobSpec::new("test").needs("build"),
        JobSpec::new("publish").needs("test"),
        JobSpec::new("lint"),
    ];

    let report = executor(runner.clone())
        .execute(jobs, &TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap();

    assert_eq!(report.verdict, FinalVerdict::Failure);
    assert_eq!(report.exit_code(), 1);
    assert!(report.job("build").unwrap().outcome.is_failed());
    assert_eq!(
        report.job("test").unwrap().outcome.skip_reason(),
        Some(SKIP_DEPENDENCY_FAILED)
    );
    assert_eq!(
        report.job("publish").unwrap().outcome.skip_reason(),
        Some(SKIP_DEPENDENCY_FAILED)
    );
    assert!(report.job("lint").unwrap().outcome.is_passed());

    let mut calls = runner.calls();
    calls.sort();
    assert_eq!(calls, vec!["build", "lint"]);
}

#[tokio::test]
async fn dependents_start_after_dependencies_pass() {
    let runner = Arc::new(FakeRunner::default().delay("build", Duration::from_millis(100)));
    let jobs = vec![
        JobSpec::new("test").needs("build"),
        JobSpec::new("build"),
    ];

    let report = executor(runner.clone())
        .execute(jobs, &TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap();

    assert_eq!(report.verdict, FinalVerdict::Success);
    assert_eq!(runner.calls(), vec!["build", "test"]);
    // Declaration order is preserved in the report.
    let names: Vec<&str> = report.jobs.iter().map(|j| j.job.as_str()).collect();
    assert_eq!(names, vec!["test", "build"]);
}

#[tokio::test]
async fn gated_jobs_skip_dependents_without_failing_the_run() {
    let runner = Arc::new(FakeRunner::default());
    let jobs = vec![
        JobSpec::new("build"),
        JobSpec::new("integration").exclude_label("skip-integration"),
        JobSpec::new("upgrade").needs("integration"),
    ];
    let event = TriggerEvent::pull_request("refs/pull/3/merge").with_label("skip-integration");

    let report = executor(runner.clone()).execute(jobs, &event).await.unwrap();

    assert_eq!(report.verdict, FinalVerdict::Success);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(
        report.job("integration").unwrap().outcome.skip_reason(),
        Some("excluded by label 'skip-integration'")
    );
    assert_eq!(
        report.job("upgrade").unwrap().outcome.skip_reason(),
        Some(SKIP_DEPENDENCY_SKIPPED)
    );
    assert_eq!(runner.calls(), vec!["build"]);
}

#[tokio::test]
async fn non_blocking_failure_does_not_gate() {
    let runner = Arc::new(FakeRunner::default().failing("flaky"));
    let jobs = vec![JobSpec::new("build"), JobSpec::new("flaky").non_blocking()];

    let report = executor(runner)
        .execute(jobs, &TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap();

    assert!(report.job("flaky").unwrap().outcome.is_failed());
    assert_eq!(report.verdict, FinalVerdict::Success);
}

#[tokio::test]
async fn crashed_job_task_is_reported_as_runner_failure() {
    let runner = Arc::new(FakeRunner::default().panicking("build"));
    let jobs = vec![JobSpec::new("build"), JobSpec::new("test").needs("build")];

    let report = executor(runner)
        .execute(jobs, &TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap();

    assert_eq!(report.verdict, FinalVerdict::Failure);
    let detail = report.job("build").unwrap().outcome.failure().unwrap();
    assert_eq!(detail.kind, FailureKind::Runner);
    assert!(detail.message.starts_with("job task failed"), "{}", detail.message);
    assert_eq!(
        report.job("test").unwrap().outcome.skip_reason(),
        Some(SKIP_DEPENDENCY_FAILED)
    );
}

#[tokio::test]
async fn cycle_is_rejected_before_anything_runs() {
    let runner = Arc::new(FakeRunner::default());
    let jobs = vec![
        JobSpec::new("a").needs("c"),
        JobSpec::new("b").needs("a"),
        JobSpec::new("c").needs("b"),
        JobSpec::new("d"),
    ];

    let err = executor(runner.clone())
        .execute(jobs, &TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap_err();

    match err {
        GateError::CyclicDependency { jobs } => {
            assert!(jobs.contains(&"a".to_string()));
            assert!(!jobs.contains(&"d".to_string()));
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn preflight_error_aborts_the_run() {
    let runner = Arc::new(FakeRunner::default().invalid("broken"));
    let jobs = vec![JobSpec::new("fine"), JobSpec::new("broken")];

    let err = executor(runner.clone())
        .execute(jobs, &TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap_err();

    assert!(matches!(err, GateError::MalformedPlan(_)));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn gated_jobs_are_not_preflighted() {
    let runner = Arc::new(FakeRunner::default().invalid("nightly"));
    let jobs = vec![
        JobSpec::new("build"),
        JobSpec::new("nightly").on(bootgate_core::TriggerKind::Dispatch),
    ];

    let report = executor(runner)
        .execute(jobs, &TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap();

    assert!(report.job("nightly").unwrap().outcome.is_skipped());
    assert_eq!(report.verdict, FinalVerdict::Success);
}

#[tokio::test]
async fn parallelism_is_bounded() {
    let mut runner = FakeRunner::default();
    let mut jobs = Vec::new();
    for i in 0..6 {
        let name = format!("job-{}", i);
        runner = runner.delay(&name, Duration::from_millis(80));
        jobs.push(JobSpec::new(name));
    }
    let runner = Arc::new(runner);

    let report = executor(runner.clone())
        .with_config(ExecutorConfig { max_parallel: 2 })
        .execute(jobs, &TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap();

    assert_eq!(report.summary.counts().passed, 6);
    assert!(runner.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn cancel_job_stops_one_job_and_its_dependents() {
    let runner = Arc::new(FakeRunner::default().delay("slow", Duration::from_secs(30)));
    let jobs = vec![
        JobSpec::new("slow"),
        JobSpec::new("after").needs("slow"),
        JobSpec::new("other"),
    ];

    let handle = executor(runner.clone()).spawn(jobs, TriggerEvent::push("refs/heads/main"));
    wait_for_call(&runner, "slow").await;
    assert!(handle.cancel_job("slow"));
    assert!(handle.cancel_job("slow"));
    assert!(!handle.cancel_job("missing"));

    let report = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.job("slow").unwrap().outcome, Outcome::Cancelled);
    assert_eq!(
        report.job("after").unwrap().outcome.skip_reason(),
        Some(SKIP_CANCELLED)
    );
    assert!(report.job("other").unwrap().outcome.is_passed());
    assert_eq!(report.verdict, FinalVerdict::Cancelled);
    assert_eq!(report.exit_code(), 130);
}

#[tokio::test]
async fn cancel_job_after_completion_is_a_no_op() {
    let runner = Arc::new(FakeRunner::default());
    let handle = executor(runner).spawn(vec![JobSpec::new("quick")], TriggerEvent::push("refs/heads/main"));
    while !handle.is_finished() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(handle.cancel_job("quick"));
    handle.cancel();
    let report = handle.wait().await.unwrap();
    assert!(report.job("quick").unwrap().outcome.is_passed());
    assert_eq!(report.verdict, FinalVerdict::Success);
}

#[tokio::test]
async fn run_cancellation_before_start_cancels_everything() {
    let runner = Arc::new(FakeRunner::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = executor(runner.clone())
        .execute_with_cancel(
            vec![JobSpec::new("a"), JobSpec::new("b").needs("a")],
            &TriggerEvent::push("refs/heads/main"),
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(report.job("a").unwrap().outcome, Outcome::Cancelled);
    assert_eq!(report.job("b").unwrap().outcome, Outcome::Cancelled);
    assert_eq!(report.verdict, FinalVerdict::Cancelled);
    assert!(runner.calls().is_empty());
}

/// Plan whose inline step blocks the first time it runs in `dir` and passes
/// on every later run.
fn blocking_plan(dir: &Path) -> PathBuf {
    plan_blocking_with(dir, "exec sleep 30")
}

/// Like [`blocking_plan`], but the first run blocks in `hang`.
fn plan_blocking_with(dir: &Path, hang: &str) -> PathBuf {
    let path = dir.join("plan.yaml");
    std::fs::write(
        &path,
        format!(
            "provision:\n  how: local\n  disk: 1\nexecute:\n  script: |\n    if [ -e marker ]; then exit 0; fi\n    touch marker\n    {}\n",
            hang
        ),
    )
    .unwrap();
    path
}

fn plan_runner(backend: Arc<RecordingBackend>) -> PlanJobRunner {
    PlanJobRunner::new(BackendRegistry::new().with_backend(Builder::Local, backend))
        .with_retry(RetryPolicy::no_retry())
        .with_runner(ScriptRunner::new(RunnerConfig {
            drain_grace: Duration::from_millis(200),
            ..RunnerConfig::default()
        }))
}

async fn wait_for_marker(dir: &Path) {
    while !dir.join("marker").exists() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn newer_push_supersedes_older_run_in_same_group() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new().with_root(dir.path()));
    let executor = GraphExecutor::new(Arc::new(plan_runner(backend.clone())));
    let jobs = vec![JobSpec::new("integration")
        .with_plan(blocking_plan(dir.path()))
        .concurrency_group("integration")];
    let event = TriggerEvent::push("refs/heads/main");

    let first = executor.spawn(jobs.clone(), event.clone());
    tokio::time::timeout(Duration::from_secs(10), wait_for_marker(dir.path()))
        .await
        .unwrap();
    let second = executor.spawn(jobs, event);

    let (first, second) = tokio::time::timeout(Duration::from_secs(20), async {
        (first.wait().await, second.wait().await)
    })
    .await
    .unwrap();
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.job("integration").unwrap().outcome, Outcome::Cancelled);
    assert_eq!(first.verdict, FinalVerdict::Cancelled);
    assert_eq!(second.verdict, FinalVerdict::Success);
    assert_eq!(
        backend.events(),
        vec![
            BackendEvent::Provisioned("env-1".to_string()),
            BackendEvent::TornDown("env-1".to_string()),
            BackendEvent::Provisioned("env-2".to_string()),
            BackendEvent::TornDown("env-2".to_string()),
        ]
    );
    assert!(!executor.groups().is_held("integration@refs/heads/main"));
}

#[tokio::test]
async fn superseded_run_leaves_no_background_processes() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new().with_root(dir.path()));
    let executor = GraphExecutor::new(Arc::new(plan_runner(backend.clone())));
    let plan = plan_blocking_with(dir.path(), "( sleep 2; touch leaked ) & wait");
    let jobs = vec![JobSpec::new("integration")
        .with_plan(plan)
        .concurrency_group("integration")];
    let event = TriggerEvent::push("refs/heads/main");

    let first = executor.spawn(jobs.clone(), event.clone());
    tokio::time::timeout(Duration::from_secs(10), wait_for_marker(dir.path()))
        .await
        .unwrap();
    let second = executor.execute(jobs, &event).await.unwrap();
    let first = first.wait().await.unwrap();

    assert_eq!(first.verdict, FinalVerdict::Cancelled);
    assert_eq!(second.verdict, FinalVerdict::Success);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!dir.path().join("leaked").exists());
    assert_eq!(backend.teardowns(), 2);
}

#[tokio::test]
async fn rerun_on_same_executor_reads_changed_scripts() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new().with_root(dir.path()));
    let executor = GraphExecutor::new(Arc::new(plan_runner(backend)));
    let plan = dir.path().join("plan.yaml");
    std::fs::write(
        &plan,
        "provision:\n  how: local\n  disk: 1\nexecute:\n  discover:\n    dir: checks\n    pattern: \"*.test\"\n  interpreter: [sh]\n",
    )
    .unwrap();
    let checks = dir.path().join("checks");
    std::fs::create_dir_all(&checks).unwrap();
    std::fs::write(checks.join("1-check.test"), "exit 1\n").unwrap();
    let jobs = vec![JobSpec::new("unit").with_plan(plan)];
    let event = TriggerEvent::push("refs/heads/main");

    let first = executor.execute(jobs.clone(), &event).await.unwrap();
    assert_eq!(first.verdict, FinalVerdict::Failure);

    std::fs::write(checks.join("1-check.test"), "exit 0\n").unwrap();
    let second = executor.execute(jobs, &event).await.unwrap();
    assert_eq!(second.verdict, FinalVerdict::Success);
}

#[tokio::test]
async fn different_refs_do_not_cancel_each_other() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new().with_root(dir.path()));
    let executor = GraphExecutor::new(Arc::new(plan_runner(backend.clone())));
    let jobs = vec![JobSpec::new("integration")
        .with_plan(blocking_plan(dir.path()))
        .concurrency_group("integration")];

    let first = executor.spawn(jobs.clone(), TriggerEvent::push("refs/heads/main"));
    tokio::time::timeout(Duration::from_secs(10), wait_for_marker(dir.path()))
        .await
        .unwrap();
    let second = executor
        .execute(jobs, &TriggerEvent::push("refs/heads/release"))
        .await
        .unwrap();

    assert_eq!(second.verdict, FinalVerdict::Success);
    assert!(!first.is_finished());
    first.cancel();
    let first = first.wait().await.unwrap();
    assert_eq!(first.verdict, FinalVerdict::Cancelled);
    backend.wait_idle().await;
    assert_eq!(backend.teardowns(), 2);
}

#[tokio::test]
async fn cancelling_a_running_job_tears_down_once() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new().with_root(dir.path()));
    let executor = GraphExecutor::new(Arc::new(plan_runner(backend.clone())));
    let jobs = vec![JobSpec::new("integration").with_plan(blocking_plan(dir.path()))];

    let handle = executor.spawn(jobs, TriggerEvent::dispatch("refs/heads/main"));
    tokio::time::timeout(Duration::from_secs(10), wait_for_marker(dir.path()))
        .await
        .unwrap();
    assert!(handle.cancel_job("integration"));
    handle.cancel();
    handle.cancel();

    let report = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap()
        .unwrap();

    let job = report.job("integration").unwrap();
    assert_eq!(job.outcome, Outcome::Cancelled);
    assert_eq!(job.environment.as_deref(), Some("local:env-1"));
    assert_eq!(backend.provisions(), 1);
    assert_eq!(backend.teardowns(), 1);
    assert_eq!(backend.live(), 0);
}

#[tokio::test]
async fn provisioning_failure_is_reported_with_exit_code() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(RecordingBackend::new().with_root(dir.path()).fail_next([
        bootgate_provision::ProvisionError::InsufficientDisk {
            requested_gib: 1,
            detail: "0 of 0 GiB available".to_string(),
        },
    ]));
    let executor = GraphExecutor::new(Arc::new(plan_runner(backend.clone())));
    let jobs = vec![
        JobSpec::new("integration").with_plan(blocking_plan(dir.path())),
        JobSpec::new("upgrade")
            .with_plan(blocking_plan(dir.path()))
            .needs("integration"),
    ];

    let report = executor
        .execute(jobs, &TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap();

    let detail = report.job("integration").unwrap().outcome.failure().unwrap();
    assert_eq!(detail.kind, FailureKind::Provision);
    assert_eq!(
        report.job("upgrade").unwrap().outcome.skip_reason(),
        Some(SKIP_DEPENDENCY_FAILED)
    );
    assert_eq!(report.exit_code(), 3);
    assert_eq!(backend.teardowns(), 0);
}
