//! Execution plans: what to provision and which scripts to run, in what order.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::digest;
use crate::domain::error::{GateError, Result};

/// Supported provisioning backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Builder {
    /// Bootable container image booted as an ephemeral VM.
    Bootc,
    /// Plain OCI container.
    Container,
    /// Scratch directory on the orchestrating host.
    Local,
}

impl Builder {
    /// All recognised builder identities.
    pub const ALL: [Builder; 3] = [Builder::Bootc, Builder::Container, Builder::Local];

    pub fn name(&self) -> &'static str {
        match self {
            Builder::Bootc => "bootc",
            Builder::Container => "container",
            Builder::Local => "local",
        }
    }

    /// Whether this builder needs a base image reference.
    pub fn requires_image(&self) -> bool {
        !matches!(self, Builder::Local)
    }
}

impl fmt::Display for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Builder {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        Builder::ALL
            .into_iter()
            .find(|b| b.name() == s)
            .ok_or_else(|| {
                GateError::MalformedPlan(format!(
                    "unrecognized builder '{}' (expected one of: bootc, container, local)",
                    s
                ))
            })
    }
}

/// What the provisioning backend must produce for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisioningSpec {
    /// Builder identity; selects the backend.
    pub builder: Builder,
    /// Base image reference.
    pub base_image: Option<String>,
    /// Image used to build the disk, when different from the default.
    pub builder_image: Option<String>,
    /// Disk size in GiB. Fixed for the environment's lifetime.
    pub disk_gib: u64,
    /// Container build context (absolute once resolved).
    pub context: PathBuf,
    /// Working directory inside the build context.
    pub workdir: Option<PathBuf>,
    /// Install the extra test-runner dependencies into the image.
    pub add_deps: bool,
}

/// How a step failure affects the remaining sequence.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Stop at the first failing step; later steps are skipped.
    #[default]
    FailFast,
    /// Run every step; each outcome is recorded.
    ContinueOnError,
}

impl ExecutionMode {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionMode::FailFast => "fail-fast",
            ExecutionMode::ContinueOnError => "continue-on-error",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExecutionMode {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail-fast" => Ok(ExecutionMode::FailFast),
            "continue" | "continue-on-error" => Ok(ExecutionMode::ContinueOnError),
            other => Err(GateError::MalformedPlan(format!(
                "unknown execution mode '{}'",
                other
            ))),
        }
    }
}

/// Where a step's command comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSource {
    /// A discovered script file.
    Script { path: PathBuf },
    /// An inline shell command from the plan document.
    Inline { command: String },
}

/// A single executable step of a plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScriptStep {
    /// Display name (file name for scripts).
    pub name: String,
    /// Leading numeric prefix of the file name, if any.
    pub ordinal: Option<u64>,
    /// The step promises not to persist state in the environment.
    pub readonly: bool,
    pub source: StepSource,
}

impl ScriptStep {
    /// Build a step for a discovered script file.
    pub fn script(path: PathBuf, readonly: bool) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            ordinal: numeric_prefix(&name),
            name,
            readonly,
            source: StepSource::Script { path },
        }
    }

    /// Build a step for an inline command.
    pub fn inline(command: String, readonly: bool) -> Self {
        Self {
            name: "inline".to_string(),
            ordinal: None,
            readonly,
            source: StepSource::Inline { command },
        }
    }

    /// Script path, if this step is file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            StepSource::Script { path } => Some(path),
            StepSource::Inline { .. } => None,
        }
    }

    /// Execution order: numbered steps ascending, then unnumbered ones;
    /// ties broken by full path.
    pub fn execution_order(&self, other: &Self) -> Ordering {
        let key = |s: &ScriptStep| (s.ordinal.is_none(), s.ordinal.unwrap_or(0));
        key(self)
            .cmp(&key(other))
            .then_with(|| self.path().cmp(&other.path()))
    }
}

/// Parse the leading ASCII digits of a file name. `None` when there are no
/// leading digits or they overflow `u64`.
pub fn numeric_prefix(name: &str) -> Option<u64> {
    let digits: String = name.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

/// A resolved, immutable plan.
///
/// Built once per job invocation by the resolver; fields are read-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutionPlan {
    summary: String,
    provisioning: ProvisioningSpec,
    steps: Vec<ScriptStep>,
    mode: ExecutionMode,
    destructive: bool,
    interpreter: Vec<String>,
    step_timeout_secs: Option<u64>,
    digest: String,
}

#[derive(Serialize)]
struct PlanIdentity<'a> {
    summary: &'a str,
    provisioning: &'a ProvisioningSpec,
    steps: &'a [ScriptStep],
    mode: ExecutionMode,
    destructive: bool,
    interpreter: &'a [String],
    step_timeout_secs: Option<u64>,
}

impl ExecutionPlan {
    /// Assemble a plan and compute its digest. Steps are expected in
    /// execution order.
    ///
    /// Step names must be unique within a plan and numeric prefixes must fit
    /// in a `u64`; either violation is a [`GateError::MalformedPlan`].
    pub fn new(
        summary: String,
        provisioning: ProvisioningSpec,
        steps: Vec<ScriptStep>,
        mode: ExecutionMode,
        destructive: bool,
        interpreter: Vec<String>,
        step_timeout_secs: Option<u64>,
    ) -> Result<Self> {
        validate_steps(&steps)?;
        let mut plan = Self {
            summary,
            provisioning,
            steps,
            mode,
            destructive,
            interpreter,
            step_timeout_secs,
            digest: String::new(),
        };
        plan.digest = plan.compute_digest()?;
        Ok(plan)
    }

    fn compute_digest(&self) -> Result<String> {
        digest::compute_digest(&PlanIdentity {
            summary: &self.summary,
            provisioning: &self.provisioning,
            steps: &self.steps,
            mode: self.mode,
            destructive: self.destructive,
            interpreter: &self.interpreter,
            step_timeout_secs: self.step_timeout_secs,
        })
    }

    /// Derive a plan with a different execution mode.
    pub fn with_mode(&self, mode: ExecutionMode) -> Result<Self> {
        if mode == self.mode {
            return Ok(self.clone());
        }
        Self::new(
            self.summary.clone(),
            self.provisioning.clone(),
            self.steps.clone(),
            mode,
            self.destructive,
            self.interpreter.clone(),
            self.step_timeout_secs,
        )
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn provisioning(&self) -> &ProvisioningSpec {
        &self.provisioning
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn is_destructive(&self) -> bool {
        self.destructive
    }

    /// Program prefix used to invoke script files (empty = exec directly).
    pub fn interpreter(&self) -> &[String] {
        &self.interpreter
    }

    /// Per-step wall-clock budget declared by the plan.
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }

    /// SHA-256 of the canonical plan.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// First 12 hex chars of the digest.
    pub fn short_digest(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }
}

fn validate_steps(steps: &[ScriptStep]) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for step in steps {
        if !seen.insert(step.name.as_str()) {
            return Err(GateError::MalformedPlan(format!(
                "step name '{}' appears more than once",
                step.name
            )));
        }
        let leading_digit = step.name.starts_with(|c: char| c.is_ascii_digit());
        if step.path().is_some() && leading_digit && step.ordinal.is_none() {
            return Err(GateError::MalformedPlan(format!(
                "numeric prefix of '{}' is out of range",
                step.name
            )));
        }
    }
    Ok(())
}
