//! Step and job outcomes, and the append-only reports that collect them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::{ErrorClass, GateError, Result};

/// Skip reason for steps after a failure in fail-fast mode.
pub const SKIP_UPSTREAM_FAILURE: &str = "upstream failure";
/// Skip reason for jobs whose dependency failed.
pub const SKIP_DEPENDENCY_FAILED: &str = "dependency failed";
/// Skip reason for jobs whose dependency never ran because of gating.
pub const SKIP_DEPENDENCY_SKIPPED: &str = "dependency skipped";
/// Skip reason for work abandoned because of cancellation.
pub const SKIP_CANCELLED: &str = "cancelled";

/// What kind of failure produced a `Failed` outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Script exited non-zero or could not be spawned.
    Script,
    /// Script exceeded its wall-clock budget.
    Timeout,
    /// No environment could be provisioned.
    Provision,
    /// The job's plan could not be resolved.
    Configuration,
    /// The job runner itself broke (e.g. panicked).
    Runner,
}

impl FailureKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            FailureKind::Script | FailureKind::Timeout => ErrorClass::TestFailure,
            FailureKind::Provision => ErrorClass::Provisioning,
            FailureKind::Configuration => ErrorClass::Configuration,
            FailureKind::Runner => ErrorClass::Internal,
        }
    }
}

/// Diagnostic detail attached to a failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDetail {
    pub kind: FailureKind,
    /// Process exit code, when the failure came from a process exit.
    pub exit_code: Option<i32>,
    pub message: String,
    /// Last lines of captured output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_tail: Vec<String>,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            exit_code: None,
            message: message.into(),
            output_tail: Vec::new(),
        }
    }

    /// Non-zero process exit with the captured output tail.
    pub fn exit(exit_code: i32, output_tail: Vec<String>) -> Self {
        Self {
            kind: FailureKind::Script,
            exit_code: Some(exit_code),
            message: format!("exited with code {}", exit_code),
            output_tail,
        }
    }

    /// Wall-clock budget exceeded.
    pub fn timeout(output_tail: Vec<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            exit_code: None,
            message: "timeout".to_string(),
            output_tail,
        }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Terminal result of a step or job. Never mutated once recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed(FailureDetail),
    Skipped { reason: String },
    /// Stopped by cancellation; neither a pass nor a failure.
    Cancelled,
}

impl Outcome {
    pub fn failed(detail: FailureDetail) -> Self {
        Outcome::Failed(detail)
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn failure(&self) -> Option<&FailureDetail> {
        match self {
            Outcome::Failed(detail) => Some(detail),
            _ => None,
        }
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match self {
            Outcome::Skipped { reason } => Some(reason),
            _ => None,
        }
    }

    /// Short lowercase label for terminal output.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Passed => "passed",
            Outcome::Failed(_) => "failed",
            Outcome::Skipped { .. } => "skipped",
            Outcome::Cancelled => "cancelled",
        }
    }
}

/// One recorded outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportEntry {
    pub name: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    /// Whether a failure of this entry blocks the verdict.
    pub blocking: bool,
}

impl ReportEntry {
    pub fn new(name: impl Into<String>, outcome: Outcome, duration_ms: u64) -> Self {
        Self {
            name: name.into(),
            outcome,
            duration_ms,
            blocking: true,
        }
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

/// Per-outcome tallies.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl OutcomeCounts {
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped + self.cancelled
    }
}

/// Append-only log of outcomes for one job (or one whole run).
///
/// Entries are never rewritten; the index of the first failure is kept for
/// diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Report {
    subject: String,
    entries: Vec<ReportEntry>,
    first_failure: Option<usize>,
}

impl Report {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            entries: Vec::new(),
            first_failure: None,
        }
    }

    /// Append an outcome. Each name may be recorded once.
    pub fn record(&mut self, entry: ReportEntry) -> Result<()> {
        if self.entries.iter().any(|e| e.name == entry.name) {
            return Err(GateError::OutcomeAlreadyRecorded {
                subject: self.subject.clone(),
                name: entry.name,
            });
        }
        if self.first_failure.is_none() && entry.outcome.is_failed() {
            self.first_failure = Some(self.entries.len());
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ReportEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// The earliest recorded failure.
    pub fn first_failure(&self) -> Option<&ReportEntry> {
        self.first_failure.and_then(|i| self.entries.get(i))
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for entry in &self.entries {
            match entry.outcome {
                Outcome::Passed => counts.passed += 1,
                Outcome::Failed(_) => counts.failed += 1,
                Outcome::Skipped { .. } => counts.skipped += 1,
                Outcome::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Whether any blocking entry failed.
    pub fn has_blocking_failure(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.blocking && e.outcome.is_failed())
    }

    pub fn has_cancellation(&self) -> bool {
        self.entries.iter().any(|e| e.outcome.is_cancelled())
    }

    /// Collapse the report into a single outcome for its subject.
    ///
    /// Failed if any blocking entry failed (carrying the first failure's
    /// detail), Cancelled if anything was cancelled, otherwise Passed.
    pub fn overall(&self) -> Outcome {
        let blocking_failure = self
            .entries
            .iter()
            .filter(|e| e.blocking)
            .find_map(|e| e.outcome.failure().map(|d| (e, d)));
        if let Some((entry, detail)) = blocking_failure {
            let mut detail = detail.clone();
            detail.message = format!("{}: {}", entry.name, detail.message);
            return Outcome::Failed(detail);
        }
        if self.has_cancellation() {
            return Outcome::Cancelled;
        }
        Outcome::Passed
    }

    /// Gate verdict for this report.
    pub fn verdict(&self) -> FinalVerdict {
        if self.has_blocking_failure() {
            FinalVerdict::Failure
        } else if self.has_cancellation() {
            FinalVerdict::Cancelled
        } else {
            FinalVerdict::Success
        }
    }
}

/// CI-wide gating decision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalVerdict {
    Success,
    Failure,
    Cancelled,
}

impl FinalVerdict {
    pub fn is_success(&self) -> bool {
        matches!(self, FinalVerdict::Success)
    }
}

impl fmt::Display for FinalVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinalVerdict::Success => "success",
            FinalVerdict::Failure => "failure",
            FinalVerdict::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
