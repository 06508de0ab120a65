//! CI trigger events and job specifications.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::error::{GateError, Result};

/// What kind of event started a CI run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    /// Manual dispatch.
    Dispatch,
}

impl TriggerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TriggerKind {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(TriggerKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(TriggerKind::PullRequest),
            "dispatch" | "workflow_dispatch" | "manual" => Ok(TriggerKind::Dispatch),
            other => Err(GateError::MalformedPlan(format!(
                "unknown trigger type '{}'",
                other
            ))),
        }
    }
}

/// A CI trigger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerEvent {
    #[serde(rename = "type")]
    pub kind: TriggerKind,
    /// Git ref the run is for, e.g. `refs/heads/main` or `refs/pull/12/merge`.
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Labels on the associated review request.
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Target branch; derived from `refs/heads/*` when absent.
    #[serde(default)]
    pub branch: Option<String>,
}

impl TriggerEvent {
    pub fn new(kind: TriggerKind, git_ref: impl Into<String>) -> Self {
        Self {
            kind,
            git_ref: git_ref.into(),
            labels: BTreeSet::new(),
            branch: None,
        }
    }

    pub fn push(git_ref: impl Into<String>) -> Self {
        Self::new(TriggerKind::Push, git_ref)
    }

    pub fn pull_request(git_ref: impl Into<String>) -> Self {
        Self::new(TriggerKind::PullRequest, git_ref)
    }

    pub fn dispatch(git_ref: impl Into<String>) -> Self {
        Self::new(TriggerKind::Dispatch, git_ref)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Explicit branch, or the branch named by a `refs/heads/` ref.
    pub fn branch(&self) -> Option<&str> {
        self.branch
            .as_deref()
            .or_else(|| self.git_ref.strip_prefix("refs/heads/"))
    }
}

/// Label allow/deny sets for a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LabelPolicy {
    /// Any of these present skips the job.
    #[serde(default)]
    pub exclude: BTreeSet<String>,
    /// When non-empty, at least one must be present.
    #[serde(default)]
    pub include: BTreeSet<String>,
}

fn default_blocking() -> bool {
    true
}

/// One CI job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct JobSpec {
    pub name: String,
    /// Plan document executed by this job.
    #[serde(default)]
    pub plan: Option<PathBuf>,
    /// Trigger types the job runs for; empty means all.
    #[serde(default, rename = "on")]
    pub triggers: BTreeSet<TriggerKind>,
    #[serde(default)]
    pub labels: LabelPolicy,
    /// Branch glob patterns for push and dispatch triggers; empty means all.
    #[serde(default)]
    pub branches: Vec<String>,
    /// Jobs that must pass before this one starts.
    #[serde(default)]
    pub needs: BTreeSet<String>,
    /// Newer runs in the same group (for the same ref) cancel older ones.
    #[serde(default)]
    pub concurrency_group: Option<String>,
    /// Whether a failure blocks merge.
    #[serde(default = "default_blocking")]
    pub blocking: bool,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            plan: None,
            triggers: BTreeSet::new(),
            labels: LabelPolicy::default(),
            branches: Vec::new(),
            needs: BTreeSet::new(),
            concurrency_group: None,
            blocking: true,
        }
    }

    pub fn with_plan(mut self, plan: impl Into<PathBuf>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn on(mut self, kind: TriggerKind) -> Self {
        self.triggers.insert(kind);
        self
    }

    pub fn needs(mut self, job: impl Into<String>) -> Self {
        self.needs.insert(job.into());
        self
    }

    pub fn exclude_label(mut self, label: impl Into<String>) -> Self {
        self.labels.exclude.insert(label.into());
        self
    }

    pub fn include_label(mut self, label: impl Into<String>) -> Self {
        self.labels.include.insert(label.into());
        self
    }

    pub fn branch(mut self, pattern: impl Into<String>) -> Self {
        self.branches.push(pattern.into());
        self
    }

    pub fn concurrency_group(mut self, group: impl Into<String>) -> Self {
        self.concurrency_group = Some(group.into());
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    /// Cancellation key for this job under `event`: `<group>@<ref>`.
    pub fn concurrency_key(&self, event: &TriggerEvent) -> Option<String> {
        self.concurrency_group
            .as_ref()
            .map(|group| format!("{}@{}", group, event.git_ref))
    }
}

/// Top-level layout of a job graph document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JobGraphDocument {
    pub jobs: Vec<JobSpec>,
}
