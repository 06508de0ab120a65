//! Script runner behaviour against real shell scripts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bootgate_ci::{RunnerConfig, ScriptRunner, StepObserver, Stream, TracingObserver};
use bootgate_core::{
    discover_steps, Builder, ExecutionMode, ExecutionPlan, FailureKind, Outcome, ProvisioningSpec,
    ScriptStep, SKIP_CANCELLED, SKIP_UPSTREAM_FAILURE,
};
use bootgate_provision::Environment;
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

fn script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
}

fn plan(steps: Vec<ScriptStep>, mode: ExecutionMode, timeout_secs: Option<u64>) -> ExecutionPlan {
    ExecutionPlan::new(
        "runner".to_string(),
        ProvisioningSpec {
            builder: Builder::Local,
            base_image: None,
            builder_image: None,
            disk_gib: 1,
            context: PathBuf::from("/"),
            workdir: None,
            add_deps: false,
        },
        steps,
        mode,
        false,
        vec!["sh".to_string()],
        timeout_secs,
    )
    .unwrap()
}

fn env(root: &Path) -> Environment {
    Environment {
        id: "test".to_string(),
        builder: Builder::Local,
        root: root.to_path_buf(),
        exec_prefix: Vec::new(),
        env: BTreeMap::new(),
    }
}

/// Five scripts where the third fails.
fn suite(failing: &str) -> (TempDir, Vec<ScriptStep>) {
    let dir = tempdir().unwrap();
    for (i, name) in ["1-a.test", "2-b.test", "3-c.test", "4-d.test", "5-e.test"]
        .iter()
        .enumerate()
    {
        let body = if *name == failing {
            "echo boom >&2; exit 3".to_string()
        } else {
            format!("echo {} >> order.log", i + 1)
        };
        script(dir.path(), name, &body);
    }
    let steps = discover_steps(dir.path(), "*.test", true).unwrap();
    (dir, steps)
}

fn fast_runner() -> ScriptRunner {
    ScriptRunner::new(RunnerConfig {
        drain_grace: Duration::from_millis(200),
        ..RunnerConfig::default()
    })
}

#[tokio::test]
async fn fail_fast_skips_everything_after_the_failure() {
    let (dir, steps) = suite("3-c.test");
    let plan = plan(steps, ExecutionMode::FailFast, None);

    let report = fast_runner()
        .run("suite", &plan, &env(dir.path()), &TracingObserver, &CancellationToken::new())
        .await;

    assert_eq!(report.len(), 5);
    assert_eq!(report.counts().failed, 1);
    assert!(report.entries()[0].outcome.is_passed());
    assert!(report.entries()[1].outcome.is_passed());
    let failure = report.entries()[2].outcome.failure().unwrap();
    assert_eq!(failure.exit_code, Some(3));
    assert_eq!(failure.output_tail, vec!["boom".to_string()]);
    for entry in &report.entries()[3..] {
        assert_eq!(entry.outcome.skip_reason(), Some(SKIP_UPSTREAM_FAILURE));
    }
    assert_eq!(report.first_failure().unwrap().name, "3-c.test");

    let log = std::fs::read_to_string(dir.path().join("order.log")).unwrap();
    assert_eq!(log, "1\n2\n");
}

#[tokio::test]
async fn continue_on_error_records_every_step() {
    let (dir, steps) = suite("2-b.test");
    let plan = plan(steps, ExecutionMode::ContinueOnError, None);

    let report = fast_runner()
        .run("suite", &plan, &env(dir.path()), &TracingObserver, &CancellationToken::new())
        .await;

    assert_eq!(report.len(), 5);
    assert_eq!(report.counts().failed, 1);
    assert_eq!(report.counts().passed, 4);
    assert!(report.entries().iter().all(|e| !e.outcome.is_skipped()));
    let log = std::fs::read_to_string(dir.path().join("order.log")).unwrap();
    assert_eq!(log, "1\n3\n4\n5\n");
}

#[tokio::test]
async fn timeout_aborts_sequence_even_in_continue_mode() {
    let dir = tempdir().unwrap();
    script(dir.path(), "1-hang.test", "exec sleep 30");
    script(dir.path(), "2-after.test", "exit 0");
    let steps = discover_steps(dir.path(), "*.test", true).unwrap();
    let plan = plan(steps, ExecutionMode::ContinueOnError, Some(1));

    let started = std::time::Instant::now();
    let report = fast_runner()
        .run("suite", &plan, &env(dir.path()), &TracingObserver, &CancellationToken::new())
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    let failure = report.entries()[0].outcome.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert_eq!(failure.message, "timeout");
    assert_eq!(report.entries()[1].outcome.skip_reason(), Some(SKIP_UPSTREAM_FAILURE));
}

#[tokio::test]
async fn cancellation_kills_the_running_step() {
    let dir = tempdir().unwrap();
    script(dir.path(), "1-long.test", "exec sleep 30");
    script(dir.path(), "2-next.test", "exit 0");
    let steps = discover_steps(dir.path(), "*.test", true).unwrap();
    let plan = plan(steps, ExecutionMode::FailFast, None);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let report = fast_runner()
        .run("suite", &plan, &env(dir.path()), &TracingObserver, &cancel)
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.entries()[0].outcome, Outcome::Cancelled);
    assert_eq!(report.entries()[1].outcome.skip_reason(), Some(SKIP_CANCELLED));
    assert_eq!(report.counts().failed, 0);
}

#[tokio::test]
async fn timeout_terminates_grandchildren() {
    let dir = tempdir().unwrap();
    script(dir.path(), "1-nested.test", "( sleep 2; touch leaked ) ; true");
    let steps = discover_steps(dir.path(), "*.test", true).unwrap();
    let plan = plan(steps, ExecutionMode::FailFast, Some(1));

    let report = fast_runner()
        .run("suite", &plan, &env(dir.path()), &TracingObserver, &CancellationToken::new())
        .await;

    let failure = report.entries()[0].outcome.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!dir.path().join("leaked").exists());
}

#[tokio::test]
async fn cancellation_terminates_background_children() {
    let dir = tempdir().unwrap();
    script(dir.path(), "1-forks.test", "( sleep 2; touch leaked ) & wait");
    let steps = discover_steps(dir.path(), "*.test", true).unwrap();
    let plan = plan(steps, ExecutionMode::FailFast, None);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let report = fast_runner()
        .run("suite", &plan, &env(dir.path()), &TracingObserver, &cancel)
        .await;

    assert_eq!(report.entries()[0].outcome, Outcome::Cancelled);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!dir.path().join("leaked").exists());
}

#[tokio::test]
async fn background_children_do_not_outlive_a_passing_step() {
    let dir = tempdir().unwrap();
    script(dir.path(), "1-detach.test", "( sleep 1; touch leaked ) >/dev/null 2>&1 &");
    let steps = discover_steps(dir.path(), "*.test", true).unwrap();
    let plan = plan(steps, ExecutionMode::FailFast, None);

    let report = fast_runner()
        .run("suite", &plan, &env(dir.path()), &TracingObserver, &CancellationToken::new())
        .await;

    assert!(report.entries()[0].outcome.is_passed());
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!dir.path().join("leaked").exists());
}

#[tokio::test]
async fn ignored_sigterm_escalates_to_sigkill() {
    let dir = tempdir().unwrap();
    script(dir.path(), "1-stubborn.test", "trap '' TERM; sleep 30");
    let steps = discover_steps(dir.path(), "*.test", true).unwrap();
    let plan = plan(steps, ExecutionMode::FailFast, Some(1));

    let started = std::time::Instant::now();
    let report = fast_runner()
        .run("suite", &plan, &env(dir.path()), &TracingObserver, &CancellationToken::new())
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    let failure = report.entries()[0].outcome.failure().unwrap();
    assert_eq!(failure.kind, FailureKind::Timeout);
}

#[derive(Default)]
struct Collecting {
    lines: Mutex<Vec<(String, Stream, String)>>,
}

impl StepObserver for Collecting {
    fn line(&self, _subject: &str, step: &ScriptStep, stream: Stream, line: &str) {
        self.lines
            .lock()
            .unwrap()
            .push((step.name.clone(), stream, line.to_string()));
    }
}

#[tokio::test]
async fn output_is_streamed_to_observer() {
    let dir = tempdir().unwrap();
    script(dir.path(), "1-talk.test", "echo out; echo err >&2; printf partial");
    let steps = discover_steps(dir.path(), "*.test", true).unwrap();
    let plan = plan(steps, ExecutionMode::FailFast, None);
    let observer = Arc::new(Collecting::default());

    let report = fast_runner()
        .run("suite", &plan, &env(dir.path()), observer.as_ref(), &CancellationToken::new())
        .await;

    assert!(report.entries()[0].outcome.is_passed());
    let lines = observer.lines.lock().unwrap().clone();
    assert!(lines.contains(&("1-talk.test".to_string(), Stream::Stdout, "out".to_string())));
    assert!(lines.contains(&("1-talk.test".to_string(), Stream::Stderr, "err".to_string())));
    assert!(lines.contains(&("1-talk.test".to_string(), Stream::Stdout, "partial".to_string())));
}

#[tokio::test]
async fn output_tail_is_bounded() {
    let dir = tempdir().unwrap();
    script(dir.path(), "1-noisy.test", "i=0; while [ $i -lt 100 ]; do echo line$i; i=$((i+1)); done; exit 1");
    let steps = discover_steps(dir.path(), "*.test", true).unwrap();
    let plan = plan(steps, ExecutionMode::FailFast, None);
    let runner = ScriptRunner::new(RunnerConfig {
        tail_lines: 5,
        ..RunnerConfig::default()
    });

    let report = runner
        .run("suite", &plan, &env(dir.path()), &TracingObserver, &CancellationToken::new())
        .await;

    let failure = report.entries()[0].outcome.failure().unwrap();
    assert_eq!(failure.output_tail.len(), 5);
    assert_eq!(failure.output_tail.last().map(String::as_str), Some("line99"));
}
