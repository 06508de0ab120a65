//! bootgate - merge gate for bootable container images
//!
//! ## Commands
//!
//! - `resolve`: Resolve a plan document and print the execution plan
//! - `run`: Provision an environment and run one plan's scripts
//! - `execute-graph`: Run a CI job graph for a trigger event
//!
//! Exit codes: 0 success, 1 test failure, 2 configuration error,
//! 3 provisioning failure, 130 cancelled.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bootgate_ci::{
    render_run_summary_md, write_run_report_json, ExecutorConfig, GraphExecutor, JobGraph,
    PlanJobRunner, RunReport, RunnerConfig, ScriptRunner, StepObserver, Stream, DEFAULT_MAX_PARALLEL,
};
use bootgate_core::{
    init_tracing, load_job_graph, resolve_path, Admission, Builder, ErrorClass, ExecutionMode,
    GateError, GatingPolicy, JobSpec, Outcome, ScriptStep, TriggerEvent, TriggerKind,
    SKIP_DEPENDENCY_SKIPPED,
};
use bootgate_provision::local::DEFAULT_LOCAL_CAPACITY_GIB;
use bootgate_provision::{BackendRegistry, CommandBackend, LocalBackend, RetryPolicy};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "bootgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provision ephemeral systems, run test plans, gate merges", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a plan document and print the resulting execution plan
    Resolve {
        /// Plan document (YAML)
        plan: PathBuf,

        /// Override the plan's execution mode
        #[arg(long)]
        mode: Option<ExecutionMode>,

        /// Print the plan as JSON
        #[arg(long = "as-json")]
        as_json: bool,
    },

    /// Provision an environment and run a single plan
    Run {
        /// Plan document (YAML)
        plan: PathBuf,

        /// Override the plan's execution mode (fail-fast, continue-on-error)
        #[arg(long)]
        mode: Option<ExecutionMode>,

        #[command(flatten)]
        engine: EngineArgs,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Run a CI job graph for a trigger event
    ExecuteGraph {
        /// Job graph document (YAML)
        jobs: PathBuf,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Print admission decisions and execution order without running
        #[arg(long)]
        dry_run: bool,

        /// Upper bound on concurrently running jobs
        #[arg(long, env = "BOOTGATE_MAX_PARALLEL", default_value_t = DEFAULT_MAX_PARALLEL)]
        max_parallel: usize,

        #[command(flatten)]
        engine: EngineArgs,

        #[command(flatten)]
        output: OutputArgs,
    },
}

/// Provisioning and runner settings shared by `run` and `execute-graph`.
#[derive(Args, Debug, Clone)]
struct EngineArgs {
    /// External provisioner program for the bootc and container builders
    #[arg(long, env = "BOOTGATE_PROVISIONER")]
    provisioner: Option<PathBuf>,

    /// Directory for local environments
    #[arg(long, env = "BOOTGATE_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Disk budget shared by local environments, in GiB
    #[arg(long, env = "BOOTGATE_LOCAL_CAPACITY_GIB", default_value_t = DEFAULT_LOCAL_CAPACITY_GIB)]
    local_capacity_gib: u64,

    /// Retries after a transient provisioning failure
    #[arg(long, env = "BOOTGATE_MAX_RETRIES", default_value_t = bootgate_provision::retry::DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Per-step timeout in seconds for plans that declare none
    #[arg(long, env = "BOOTGATE_STEP_TIMEOUT")]
    step_timeout: Option<u64>,
}

#[derive(Args, Debug, Clone)]
struct TriggerArgs {
    /// Trigger type (push, pull_request, dispatch)
    #[arg(long, default_value = "push")]
    event: TriggerKind,

    /// Git ref of the run
    #[arg(long = "ref", default_value = "HEAD")]
    git_ref: String,

    /// Target branch (derived from refs/heads/* when omitted)
    #[arg(long)]
    branch: Option<String>,

    /// Label on the review request (repeatable)
    #[arg(long = "label")]
    labels: Vec<String>,

    /// Read the trigger event from a JSON file; flags add labels
    #[arg(long)]
    event_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct OutputArgs {
    /// Write the run report as JSON
    #[arg(long)]
    report: Option<PathBuf>,

    /// Write a Markdown summary
    #[arg(long)]
    summary: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {:#}", err);
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let verbose = cli.verbose;
    match cli.command {
        Commands::Resolve {
            plan,
            mode,
            as_json,
        } => cmd_resolve(&plan, mode, as_json),
        Commands::Run {
            plan,
            mode,
            engine,
            output,
        } => cmd_run(&plan, mode, &engine, &output, verbose).await,
        Commands::ExecuteGraph {
            jobs,
            trigger,
            dry_run,
            max_parallel,
            engine,
            output,
        } => {
            let event = trigger_event(&trigger)?;
            let specs = load_job_graph(&jobs)
                .with_context(|| format!("Failed to load job graph {}", jobs.display()))?;
            if dry_run {
                cmd_plan_graph(specs, &event)
            } else {
                cmd_execute_graph(specs, &event, max_parallel, &engine, &output, verbose).await
            }
        }
    }
}

/// Map an error to a process exit code via its error class.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<GateError>())
        .map(|gate| gate.class().exit_code())
        .unwrap_or_else(|| ErrorClass::Internal.exit_code())
}

fn trigger_event(args: &TriggerArgs) -> Result<TriggerEvent> {
    let mut event = match &args.event_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read event file {}", path.display()))?;
            serde_json::from_str::<TriggerEvent>(&content).map_err(|e| {
                GateError::MalformedPlan(format!("invalid event file {}: {}", path.display(), e))
            })?
        }
        None => TriggerEvent::new(args.event, args.git_ref.clone()),
    };
    if let Some(branch) = &args.branch {
        event.branch = Some(branch.clone());
    }
    event.labels.extend(args.labels.iter().cloned());
    Ok(event)
}

fn registry(engine: &EngineArgs) -> Result<BackendRegistry> {
    let workdir = match &engine.workdir {
        Some(dir) => dir.clone(),
        None => std::env::temp_dir().join("bootgate"),
    };
    std::fs::create_dir_all(&workdir)
        .with_context(|| format!("Failed to create workdir {}", workdir.display()))?;

    let mut registry = BackendRegistry::new().with_backend(
        Builder::Local,
        Arc::new(LocalBackend::new(workdir, engine.local_capacity_gib)),
    );
    if let Some(program) = &engine.provisioner {
        for builder in [Builder::Bootc, Builder::Container] {
            registry.register(builder, Arc::new(CommandBackend::new(builder, program.clone())));
        }
    }
    Ok(registry)
}

fn plan_runner(engine: &EngineArgs, mode: Option<ExecutionMode>, verbose: bool) -> Result<PlanJobRunner> {
    let mut config = RunnerConfig::default();
    if let Some(secs) = engine.step_timeout {
        config.default_step_timeout = Duration::from_secs(secs.max(1));
    }
    let retry = RetryPolicy {
        max_retries: engine.max_retries,
        ..RetryPolicy::default()
    };
    let mut runner = PlanJobRunner::new(registry(engine)?)
        .with_runner(ScriptRunner::new(config))
        .with_retry(retry)
        .with_observer(Arc::new(ConsoleObserver { verbose }));
    if let Some(mode) = mode {
        runner = runner.with_mode(mode);
    }
    Ok(runner)
}

/// Cancel `token` on Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            token.cancel();
        }
    });
}

/// Resolve a plan and print it
fn cmd_resolve(path: &Path, mode: Option<ExecutionMode>, as_json: bool) -> Result<i32> {
    let mut plan = resolve_path(path)
        .with_context(|| format!("Failed to resolve plan {}", path.display()))?;
    if let Some(mode) = mode {
        plan = plan.with_mode(mode)?;
    }

    if as_json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    let provisioning = plan.provisioning();
    println!("Plan: {}", plan.summary());
    println!("Digest: {}", plan.short_digest());
    println!("Builder: {}", provisioning.builder);
    if let Some(image) = &provisioning.base_image {
        println!("Image: {}", image);
    }
    println!("Disk: {} GiB", provisioning.disk_gib);
    println!("Mode: {}", plan.mode());
    println!();
    for (index, step) in plan.steps().iter().enumerate() {
        let access = if step.readonly { "readonly" } else { "destructive" };
        println!("  {:>3}. {} ({})", index + 1, step.name, access);
    }
    Ok(0)
}

/// Provision and run a single plan
async fn cmd_run(
    path: &Path,
    mode: Option<ExecutionMode>,
    engine: &EngineArgs,
    output: &OutputArgs,
    verbose: bool,
) -> Result<i32> {
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plan".to_string());
    let job = JobSpec::new(name).with_plan(path);
    let event = TriggerEvent::dispatch("HEAD");

    let executor = GraphExecutor::new(Arc::new(plan_runner(engine, mode, verbose)?));
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let report = executor
        .execute_with_cancel(vec![job], &event, cancel)
        .await
        .context("Plan could not be run")?;

    print_run(&report);
    write_outputs(&report, output)?;
    Ok(report.exit_code())
}

/// Print admission decisions and execution order
fn cmd_plan_graph(specs: Vec<JobSpec>, event: &TriggerEvent) -> Result<i32> {
    let graph = JobGraph::new(specs)?;
    println!("Trigger: {} {}", event.kind, event.git_ref);
    println!();
    for line in graph_plan_lines(&graph, event)? {
        println!("  {}", line);
    }
    Ok(0)
}

/// One line per job in topological order: whether it would run, and why not.
/// Dependents of a gated job are reported as skipped along with it.
fn graph_plan_lines(graph: &JobGraph, event: &TriggerEvent) -> Result<Vec<String>> {
    let mut blocked: BTreeSet<String> = BTreeSet::new();
    let mut lines = Vec::new();
    for name in graph.topological_order() {
        let Some(job) = graph.get(&name) else {
            continue;
        };
        let decision = if blocked.contains(&name) {
            Admission::Skip(SKIP_DEPENDENCY_SKIPPED.to_string())
        } else {
            GatingPolicy::for_job(job)?.admit(event, &event.labels)
        };
        let needs: Vec<&str> = graph.dependencies_of(&name);
        let needs = if needs.is_empty() {
            String::new()
        } else {
            format!(" (needs {})", needs.join(", "))
        };
        match decision.skip_reason() {
            None => lines.push(format!("run  {}{}", name, needs)),
            Some(reason) => {
                blocked.extend(graph.transitive_dependents_of(&name));
                lines.push(format!("skip {}{}: {}", name, needs, reason));
            }
        }
    }
    Ok(lines)
}

/// Run a job graph
async fn cmd_execute_graph(
    specs: Vec<JobSpec>,
    event: &TriggerEvent,
    max_parallel: usize,
    engine: &EngineArgs,
    output: &OutputArgs,
    verbose: bool,
) -> Result<i32> {
    info!(trigger = %event.kind, git_ref = %event.git_ref, jobs = specs.len(), "Executing job graph");

    let executor = GraphExecutor::new(Arc::new(plan_runner(engine, None, verbose)?))
        .with_config(ExecutorConfig { max_parallel });
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let report = executor
        .execute_with_cancel(specs, event, cancel)
        .await
        .context("Job graph could not be run")?;

    print_run(&report);
    write_outputs(&report, output)?;
    Ok(report.exit_code())
}

fn status_mark(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Passed => "✓",
        Outcome::Failed(_) => "✗",
        Outcome::Skipped { .. } => "-",
        Outcome::Cancelled => "⊘",
    }
}

fn print_run(report: &RunReport) {
    println!();
    println!("Run ID: {}", report.run_id);
    for job in &report.jobs {
        let detail = match &job.outcome {
            Outcome::Failed(detail) => format!(": {}", detail),
            Outcome::Skipped { reason } => format!(": {}", reason),
            _ => String::new(),
        };
        let optional = if job.blocking { "" } else { " [non-blocking]" };
        println!(
            "  {} {} ({}ms){}{}",
            status_mark(&job.outcome),
            job.job,
            job.duration_ms,
            optional,
            detail
        );
        if let Some(err) = &job.teardown_error {
            println!("      teardown: {}", err);
        }
    }

    let counts = report.summary.counts();
    println!();
    println!(
        "Summary: {} passed, {} failed, {} skipped, {} cancelled",
        counts.passed, counts.failed, counts.skipped, counts.cancelled
    );
    let mark = if report.verdict.is_success() { "✓" } else { "✗" };
    println!("Gate: {} {}", mark, report.verdict.to_string().to_uppercase());
}

fn write_outputs(report: &RunReport, output: &OutputArgs) -> Result<()> {
    if let Some(path) = &output.report {
        write_run_report_json(path, report)?;
        info!(path = %path.display(), "Wrote run report");
    }
    if let Some(path) = &output.summary {
        std::fs::write(path, render_run_summary_md(report))
            .with_context(|| format!("Failed to write summary {}", path.display()))?;
        info!(path = %path.display(), "Wrote summary");
    }
    Ok(())
}

/// Prints step progress to stdout; output lines only with `--verbose`.
struct ConsoleObserver {
    verbose: bool,
}

impl StepObserver for ConsoleObserver {
    fn step_started(&self, subject: &str, step: &ScriptStep, index: usize, total: usize) {
        println!("[{}] ({}/{}) {}", subject, index + 1, total, step.name);
    }

    fn line(&self, subject: &str, step: &ScriptStep, stream: Stream, line: &str) {
        if self.verbose {
            match stream {
                Stream::Stdout => println!("[{}] {} | {}", subject, step.name, line),
                Stream::Stderr => eprintln!("[{}] {} | {}", subject, step.name, line),
            }
        }
    }

    fn step_finished(&self, subject: &str, step: &ScriptStep, outcome: &Outcome) {
        let detail = match outcome {
            Outcome::Failed(detail) => format!(" {}", detail),
            _ => String::new(),
        };
        println!("[{}] {} {}{}", subject, status_mark(outcome), step.name, detail);
        if let Outcome::Failed(detail) = outcome {
            if !self.verbose {
                for line in &detail.output_tail {
                    println!("[{}] {} | {}", subject, step.name, line);
                }
            }
        }
    }
}
