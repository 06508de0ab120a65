//! Plan resolution: declarative plan documents to [`ExecutionPlan`] values.
//!
//! Resolution is a pure transformation apart from reading the plan file and
//! listing the script directory. Nothing is executed or provisioned here.

use std::path::{Path, PathBuf};

use glob::Pattern;
use serde::Deserialize;
use tracing::debug;

use crate::domain::error::{GateError, Result};
use crate::domain::job::{JobGraphDocument, JobSpec};
use crate::domain::plan::{Builder, ExecutionMode, ExecutionPlan, ProvisioningSpec, ScriptStep};

/// File-stem marker that flags a discovered script as non-readonly.
pub const DESTRUCTIVE_MARKER: &str = "destructive";

fn default_true() -> bool {
    true
}

fn default_execute_how() -> String {
    "script".to_string()
}

/// A plan document as written on disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PlanDocument {
    #[serde(default)]
    pub summary: Option<String>,
    pub provision: ProvisionSection,
    pub execute: ExecuteSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ProvisionSection {
    /// Builder identity.
    pub how: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub builder_image: Option<String>,
    /// Disk size in GiB.
    pub disk: i64,
    /// Build context, relative to the plan file.
    #[serde(default)]
    pub context: Option<PathBuf>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub add_deps: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ExecuteSection {
    #[serde(default = "default_execute_how")]
    pub how: String,
    #[serde(default)]
    pub discover: Option<DiscoverSection>,
    /// Inline command run after the discovered scripts.
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub interpreter: Vec<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default = "default_true")]
    pub readonly: bool,
    /// Per-step budget in seconds.
    #[serde(default)]
    pub timeout: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverSection {
    /// Script directory, relative to the plan file.
    pub dir: PathBuf,
    /// Glob matched against file names.
    pub pattern: String,
}

impl PlanDocument {
    /// Parse a YAML plan. `origin` is only used in error messages.
    pub fn parse(yaml: &str, origin: &Path) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|source| GateError::Document {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Read and parse a plan file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|source| GateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&yaml, path)
    }
}

/// Read a plan file and resolve it relative to its own directory.
pub fn resolve_path(path: &Path) -> Result<ExecutionPlan> {
    let doc = PlanDocument::from_path(path)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let default_summary = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plan".to_string());
    resolve_with_summary(&doc, base_dir, default_summary)
}

/// Resolve a parsed plan document. Relative paths are taken from `base_dir`.
pub fn resolve(doc: &PlanDocument, base_dir: &Path) -> Result<ExecutionPlan> {
    resolve_with_summary(doc, base_dir, "plan".to_string())
}

fn resolve_with_summary(
    doc: &PlanDocument,
    base_dir: &Path,
    default_summary: String,
) -> Result<ExecutionPlan> {
    let base_dir = absolutize(base_dir)?;
    let provisioning = resolve_provisioning(&doc.provision, &base_dir)?;
    let execute = &doc.execute;

    if execute.how != "script" && execute.how != "tmt" {
        return Err(GateError::MalformedPlan(format!(
            "unsupported execute method '{}'",
            execute.how
        )));
    }

    let mode = match &execute.mode {
        Some(mode) => mode.parse::<ExecutionMode>()?,
        None => ExecutionMode::default(),
    };

    let step_timeout_secs = match execute.timeout {
        Some(secs) if secs <= 0 => {
            return Err(GateError::MalformedPlan(format!(
                "execute.timeout must be positive, got {}",
                secs
            )))
        }
        Some(secs) => Some(secs as u64),
        None => None,
    };

    let mut steps = match &execute.discover {
        Some(discover) => {
            discover_steps(&base_dir.join(&discover.dir), &discover.pattern, execute.readonly)?
        }
        None => Vec::new(),
    };
    if let Some(command) = &execute.script {
        steps.push(ScriptStep::inline(command.clone(), execute.readonly));
    }

    if steps.is_empty() {
        let (dir, pattern) = match &execute.discover {
            Some(d) => (base_dir.join(&d.dir), d.pattern.clone()),
            None => (base_dir.clone(), String::new()),
        };
        return Err(GateError::NoScriptsFound { dir, pattern });
    }

    if !execute.destructive {
        if let Some(step) = steps.iter().find(|s| !s.readonly) {
            return Err(GateError::MalformedPlan(format!(
                "step '{}' is not readonly but the plan is not marked destructive",
                step.name
            )));
        }
    }

    let summary = doc.summary.clone().unwrap_or(default_summary);
    let plan = ExecutionPlan::new(
        summary,
        provisioning,
        steps,
        mode,
        execute.destructive,
        execute.interpreter.clone(),
        step_timeout_secs,
    )?;
    debug!(
        plan = %plan.short_digest(),
        steps = plan.steps().len(),
        mode = %plan.mode(),
        "resolved plan"
    );
    Ok(plan)
}

fn resolve_provisioning(section: &ProvisionSection, base_dir: &Path) -> Result<ProvisioningSpec> {
    let builder: Builder = section.how.parse()?;

    if section.disk <= 0 {
        return Err(GateError::MalformedPlan(format!(
            "disk size must be positive, got {}",
            section.disk
        )));
    }

    let base_image = section.image.clone().filter(|s| !s.trim().is_empty());
    if builder.requires_image() && base_image.is_none() {
        return Err(GateError::MalformedPlan(format!(
            "builder '{}' requires provision.image",
            builder
        )));
    }

    let context = match &section.context {
        Some(ctx) => base_dir.join(ctx),
        None => base_dir.to_path_buf(),
    };

    Ok(ProvisioningSpec {
        builder,
        base_image,
        builder_image: section.builder_image.clone(),
        disk_gib: section.disk as u64,
        context,
        workdir: section.workdir.clone(),
        add_deps: section.add_deps,
    })
}

/// List `dir`, keep files whose name matches `pattern`, and order them by
/// numeric prefix (ties and unnumbered files by full path).
pub fn discover_steps(dir: &Path, pattern: &str, readonly: bool) -> Result<Vec<ScriptStep>> {
    let matcher = Pattern::new(pattern).map_err(|e| {
        GateError::MalformedPlan(format!("invalid discovery pattern '{}': {}", pattern, e))
    })?;

    let entries = std::fs::read_dir(dir).map_err(|source| GateError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut steps = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| GateError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !matcher.matches(&name) {
            continue;
        }
        let destructive = path
            .file_stem()
            .map(|s| s.to_string_lossy().contains(DESTRUCTIVE_MARKER))
            .unwrap_or(false);
        steps.push(ScriptStep::script(path, readonly && !destructive));
    }

    steps.sort_by(|a, b| a.execution_order(b));
    Ok(steps)
}

/// Read a job graph document. Plan paths are made relative to the
/// document's directory.
pub fn load_job_graph(path: &Path) -> Result<Vec<JobSpec>> {
    let yaml = std::fs::read_to_string(path).map_err(|source| GateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: JobGraphDocument = serde_yaml::from_str(&yaml).map_err(|source| GateError::Document {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = absolutize(path.parent().unwrap_or_else(|| Path::new(".")))?;
    Ok(doc
        .jobs
        .into_iter()
        .map(|mut job| {
            job.plan = job.plan.map(|p| base_dir.join(p));
            job
        })
        .collect())
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| GateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if path.as_os_str().is_empty() {
        Ok(cwd)
    } else {
        Ok(cwd.join(path))
    }
}
