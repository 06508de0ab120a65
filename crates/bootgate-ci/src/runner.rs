//! Test script execution inside a provisioned environment.
//!
//! Steps run strictly one after another, each as its own process with the
//! environment root as working directory. Output is streamed line by line
//! to a [`StepObserver`] while a bounded tail is kept for failure detail.
//!
//! Each step gets its own process group. Timeout and cancellation signal the
//! whole group (SIGTERM, then SIGKILL after the drain grace), and whatever is
//! left of the group is killed once the step is over.

use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use bootgate_core::{
    ExecutionMode, ExecutionPlan, FailureDetail, FailureKind, Outcome, Report, ReportEntry,
    ScriptStep, StepSource, SKIP_CANCELLED, SKIP_UPSTREAM_FAILURE,
};
use bootgate_provision::Environment;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::output::{OutputTail, StepObserver, Stream};

/// Default wall-clock budget per step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Default number of output lines kept per step.
pub const DEFAULT_TAIL_LINES: usize = 40;
/// Default byte cap per kept line.
pub const DEFAULT_TAIL_LINE_BYTES: usize = 4096;
/// Default time allowed to drain pipes after the process exits.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Tunables for [`ScriptRunner`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Budget for steps whose plan declares none.
    pub default_step_timeout: Duration,
    pub tail_lines: usize,
    pub tail_line_bytes: usize,
    /// After exit, background children may still hold the pipes open; stop
    /// reading after this long.
    pub drain_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: DEFAULT_STEP_TIMEOUT,
            tail_lines: DEFAULT_TAIL_LINES,
            tail_line_bytes: DEFAULT_TAIL_LINE_BYTES,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// Why a step process stopped.
enum Termination {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

/// Line reader over one child pipe.
struct Pipe<R> {
    reader: Option<BufReader<R>>,
    buf: Vec<u8>,
    stream: Stream,
}

impl<R: AsyncRead + Unpin> Pipe<R> {
    fn new(reader: Option<R>, stream: Stream) -> Self {
        Self {
            reader: reader.map(BufReader::new),
            buf: Vec::new(),
            stream,
        }
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    /// Read the next line. Partial reads stay in `buf` across cancellation.
    async fn next_line(&mut self) -> Option<String> {
        let reader = self.reader.as_mut()?;
        match reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) | Err(_) => {
                self.reader = None;
                self.take_partial()
            }
            Ok(_) => Some(self.take_line()),
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        self.buf.clear();
        line
    }

    fn take_partial(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }
}

/// Executes the steps of a plan.
#[derive(Debug, Clone, Default)]
pub struct ScriptRunner {
    config: RunnerConfig,
}

impl ScriptRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run every step of `plan` in `env` and collect one outcome per step.
    ///
    /// Fail-fast mode stops at the first failure; continue-on-error keeps
    /// going. A timeout stops the sequence in either mode. Cancellation
    /// kills the in-flight step.
    pub async fn run(
        &self,
        subject: &str,
        plan: &ExecutionPlan,
        env: &Environment,
        observer: &dyn StepObserver,
        cancel: &CancellationToken,
    ) -> Report {
        let steps = plan.steps();
        let timeout = plan.step_timeout().unwrap_or(self.config.default_step_timeout);
        let mut report = Report::new(subject);
        let mut halted: Option<&'static str> = None;

        info!(
            job = %subject,
            plan = %plan.short_digest(),
            steps = steps.len(),
            mode = %plan.mode(),
            env = %env,
            "Running plan"
        );

        for (index, step) in steps.iter().enumerate() {
            if halted.is_none() && cancel.is_cancelled() {
                halted = Some(SKIP_CANCELLED);
            }

            let (outcome, duration_ms) = match halted {
                Some(reason) => (Outcome::skipped(reason), 0),
                None => {
                    observer.step_started(subject, step, index, steps.len());
                    let start = Instant::now();
                    let outcome = self
                        .run_step(subject, plan, step, index, env, timeout, observer, cancel)
                        .await;
                    observer.step_finished(subject, step, &outcome);
                    (outcome, start.elapsed().as_millis() as u64)
                }
            };

            if halted.is_none() {
                halted = match &outcome {
                    Outcome::Failed(detail) if detail.kind == FailureKind::Timeout => {
                        Some(SKIP_UPSTREAM_FAILURE)
                    }
                    Outcome::Failed(_) if plan.mode() == ExecutionMode::FailFast => {
                        Some(SKIP_UPSTREAM_FAILURE)
                    }
                    Outcome::Cancelled => Some(SKIP_CANCELLED),
                    _ => None,
                };
            }

            if let Err(err) = report.record(ReportEntry::new(step.name.clone(), outcome, duration_ms)) {
                warn!(job = %subject, step = %step.name, error = %err, "Dropping duplicate step outcome");
            }
        }

        let counts = report.counts();
        info!(
            job = %subject,
            passed = counts.passed,
            failed = counts.failed,
            skipped = counts.skipped,
            cancelled = counts.cancelled,
            "Plan finished"
        );
        report
    }

    fn command_for(plan: &ExecutionPlan, step: &ScriptStep, env: &Environment) -> Vec<String> {
        let mut argv = env.exec_prefix.clone();
        match &step.source {
            StepSource::Script { path } => {
                argv.extend(plan.interpreter().iter().cloned());
                argv.push(path.to_string_lossy().into_owned());
            }
            StepSource::Inline { command } => {
                argv.extend(["sh".to_string(), "-c".to_string(), command.clone()]);
            }
        }
        argv
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        subject: &str,
        plan: &ExecutionPlan,
        step: &ScriptStep,
        index: usize,
        env: &Environment,
        timeout: Duration,
        observer: &dyn StepObserver,
        cancel: &CancellationToken,
    ) -> Outcome {
        let argv = Self::command_for(plan, step, env);
        let Some((program, args)) = argv.split_first() else {
            return Outcome::failed(FailureDetail::new(FailureKind::Script, "empty command"));
        };

        let ordinal = step.ordinal.unwrap_or(index as u64 + 1);
        let mut cmd = step_command(program);
        cmd.args(args)
            .current_dir(&env.root)
            .envs(&env.env)
            .env("BOOTGATE_STEP", &step.name)
            .env("BOOTGATE_STEP_ORDINAL", ordinal.to_string())
            .env("BOOTGATE_ENV_ROOT", &env.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(job = %subject, step = %step.name, error = %err, "Failed to spawn step");
                return Outcome::failed(FailureDetail::new(
                    FailureKind::Script,
                    format!("failed to spawn {}: {}", program, err),
                ));
            }
        };

        let group = ProcessGroup::of(&child);
        let mut tail = OutputTail::new(self.config.tail_lines, self.config.tail_line_bytes);
        let termination = self
            .supervise(subject, step, &mut child, &group, timeout, observer, cancel, &mut tail)
            .await;
        drop(group);

        match termination {
            Termination::Exited(status) if status.success() => Outcome::Passed,
            Termination::Exited(status) => match status.code() {
                Some(code) => Outcome::failed(FailureDetail::exit(code, tail.into_lines())),
                None => Outcome::failed(FailureDetail {
                    kind: FailureKind::Script,
                    exit_code: None,
                    message: format!("terminated ({})", status),
                    output_tail: tail.into_lines(),
                }),
            },
            Termination::TimedOut => {
                warn!(job = %subject, step = %step.name, timeout_secs = timeout.as_secs(), "Step timed out");
                Outcome::failed(FailureDetail::timeout(tail.into_lines()))
            }
            Termination::Cancelled => {
                info!(job = %subject, step = %step.name, "Step cancelled");
                Outcome::Cancelled
            }
            Termination::WaitFailed(err) => Outcome::failed(FailureDetail::new(
                FailureKind::Script,
                format!("failed to wait for step: {}", err),
            )),
        }
    }

    /// Pump output until the process exits, times out or is cancelled, then
    /// drain what is left within the grace period.
    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        &self,
        subject: &str,
        step: &ScriptStep,
        child: &mut Child,
        group: &ProcessGroup,
        timeout: Duration,
        observer: &dyn StepObserver,
        cancel: &CancellationToken,
        tail: &mut OutputTail,
    ) -> Termination {
        let mut stdout = Pipe::new(child.stdout.take(), Stream::Stdout);
        let mut stderr = Pipe::new(child.stderr.take(), Stream::Stderr);
        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + DEFAULT_STEP_TIMEOUT);

        let mut killed: Option<Termination> = None;
        let mut exited: Option<std::io::Result<ExitStatus>> = None;
        let mut drain_until: Option<tokio::time::Instant> = None;
        let mut escalate_at: Option<tokio::time::Instant> = None;

        loop {
            if exited.is_some() && !stdout.is_open() && !stderr.is_open() {
                break;
            }
            let running = exited.is_none() && killed.is_none();

            tokio::select! {
                line = stdout.next_line(), if stdout.is_open() => {
                    if let Some(line) = line {
                        observer.line(subject, step, stdout.stream, &line);
                        tail.push(&line);
                    }
                }
                line = stderr.next_line(), if stderr.is_open() => {
                    if let Some(line) = line {
                        observer.line(subject, step, stderr.stream, &line);
                        tail.push(&line);
                    }
                }
                status = child.wait(), if exited.is_none() => {
                    exited = Some(status);
                    drain_until = Some(tokio::time::Instant::now() + self.config.drain_grace);
                }
                _ = tokio::time::sleep_until(deadline), if running => {
                    group.terminate();
                    escalate_at = Some(tokio::time::Instant::now() + self.config.drain_grace);
                    killed = Some(Termination::TimedOut);
                }
                _ = cancel.cancelled(), if running => {
                    group.terminate();
                    escalate_at = Some(tokio::time::Instant::now() + self.config.drain_grace);
                    killed = Some(Termination::Cancelled);
                }
                _ = sleep_until_opt(escalate_at), if escalate_at.is_some() => {
                    debug!(job = %subject, step = %step.name, "Step ignored SIGTERM, killing");
                    group.kill();
                    let _ = child.start_kill();
                    escalate_at = None;
                }
                _ = sleep_until_opt(drain_until), if drain_until.is_some() => {
                    warn!(job = %subject, step = %step.name, "Output still open after exit, abandoning");
                    break;
                }
            }
        }

        if let Some(termination) = killed {
            return termination;
        }
        match exited {
            Some(Ok(status)) => Termination::Exited(status),
            Some(Err(err)) => Termination::WaitFailed(err),
            None => Termination::WaitFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "process state unknown",
            )),
        }
    }
}

/// Command for one step, placed in a fresh process group on unix.
fn step_command(program: &str) -> Command {
    #[allow(unused_mut)]
    let mut std_cmd = std::process::Command::new(program);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }
    Command::from(std_cmd)
}

/// The process group a step's child leads.
///
/// Processes the step forks stay in the group unless they move themselves
/// out, so signalling it reaches grandchildren the step no longer waits for.
/// Dropping the handle SIGKILLs whatever is left of the group.
struct ProcessGroup {
    pgid: Option<i32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        self.signal(libc::SIGTERM);
    }

    #[cfg(unix)]
    fn kill(&self) {
        self.signal(libc::SIGKILL);
    }

    #[cfg(unix)]
    fn signal(&self, signal: libc::c_int) {
        let Some(pgid) = self.pgid else { return };
        // SAFETY: killpg(2) only delivers a signal; pgid names the group
        // created for this step's child.
        let rc = unsafe { libc::killpg(pgid, signal) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                debug!(pgid, signal, error = %err, "killpg failed");
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}

    #[cfg(not(unix))]
    fn kill(&self) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::TracingObserver;
    use bootgate_core::{Builder, ProvisioningSpec};
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn plan(steps: Vec<ScriptStep>, mode: ExecutionMode, timeout: Option<u64>) -> ExecutionPlan {
        ExecutionPlan::new(
            "unit".to_string(),
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
            Vec::new(),
            timeout,
        )
        .unwrap()
    }

    fn env(root: PathBuf) -> Environment {
        Environment {
            id: "unit".to_string(),
            builder: Builder::Local,
            root,
            exec_prefix: Vec::new(),
            env: BTreeMap::from([("GREETING".to_string(), "hi".to_string())]),
        }
    }

    fn inline(cmd: &str) -> ScriptStep {
        ScriptStep::inline(cmd.to_string(), true)
    }

    #[tokio::test]
    async fn test_inline_step_sees_environment() {
        let dir = tempdir().unwrap();
        let step = inline("test \"$GREETING\" = hi && test \"$BOOTGATE_STEP\" = inline && test \"$(pwd -P)\" = \"$(cd \"$BOOTGATE_ENV_ROOT\" && pwd -P)\"");
        let plan = plan(vec![step], ExecutionMode::FailFast, None);
        let report = ScriptRunner::default()
            .run("unit", &plan, &env(dir.path().to_path_buf()), &TracingObserver, &CancellationToken::new())
            .await;
        assert!(report.entries()[0].outcome.is_passed(), "{:?}", report.entries()[0]);
    }

    #[tokio::test]
    async fn test_failure_captures_exit_code_and_tail() {
        let dir = tempdir().unwrap();
        let plan = plan(
            vec![inline("echo first; echo second >&2; exit 7")],
            ExecutionMode::FailFast,
            None,
        );
        let report = ScriptRunner::default()
            .run("unit", &plan, &env(dir.path().to_path_buf()), &TracingObserver, &CancellationToken::new())
            .await;
        let detail = report.entries()[0].outcome.failure().unwrap();
        assert_eq!(detail.exit_code, Some(7));
        assert!(detail.output_tail.contains(&"first".to_string()));
        assert!(detail.output_tail.contains(&"second".to_string()));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_failed_step() {
        let dir = tempdir().unwrap();
        let step = ScriptStep::script(dir.path().join("1-missing.test"), true);
        let plan = plan(vec![step], ExecutionMode::FailFast, None);
        let report = ScriptRunner::default()
            .run("unit", &plan, &env(dir.path().to_path_buf()), &TracingObserver, &CancellationToken::new())
            .await;
        let detail = report.entries()[0].outcome.failure().unwrap();
        assert!(detail.message.starts_with("failed to spawn"));
    }
}
