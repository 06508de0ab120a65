//! Gating policy: decides whether a job runs for a given trigger.
//!
//! A job's policy is three independent predicates evaluated in order:
//!
//! | Predicate | Applies to             | Skips when                          |
//! |-----------|------------------------|-------------------------------------|
//! | trigger   | all events             | event type not in the job's `on`    |
//! | exclusion | all events             | an exclude label is present         |
//! | inclusion | push, pull_request     | no include label is present         |
//! | branches  | push, dispatch         | branch matches no pattern           |
//!
//! Exclusion labels take precedence over inclusion labels. Manual dispatch
//! bypasses the inclusion allow-list only; pull requests ignore branch filters.

use std::collections::BTreeSet;
use std::fmt;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::domain::error::{GateError, Result};
use crate::domain::job::{JobSpec, LabelPolicy, TriggerEvent, TriggerKind};

/// Result of evaluating a job's gating policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Admission {
    Admit,
    Skip(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admit)
    }

    pub fn skip_reason(&self) -> Option<&str> {
        match self {
            Admission::Admit => None,
            Admission::Skip(reason) => Some(reason),
        }
    }
}

impl fmt::Display for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Admission::Admit => f.write_str("admit"),
            Admission::Skip(reason) => write!(f, "skip ({})", reason),
        }
    }
}

impl LabelPolicy {
    /// Evaluate the allow/deny sets against `labels`.
    pub fn evaluate(&self, labels: &BTreeSet<String>) -> Admission {
        if let Some(skip) = self.excluded(labels) {
            return skip;
        }
        if !self.include.is_empty() && self.include.is_disjoint(labels) {
            let wanted: Vec<&str> = self.include.iter().map(String::as_str).collect();
            return Admission::Skip(format!("requires one of labels [{}]", wanted.join(", ")));
        }
        Admission::Admit
    }

    /// The deny set alone; `Some` when an exclude label is present.
    pub fn excluded(&self, labels: &BTreeSet<String>) -> Option<Admission> {
        self.exclude
            .intersection(labels)
            .next()
            .map(|label| Admission::Skip(format!("excluded by label '{}'", label)))
    }
}

/// Compiled branch glob patterns.
#[derive(Debug, Clone)]
pub struct BranchFilter {
    patterns: Vec<Pattern>,
}

impl BranchFilter {
    /// Compile branch patterns; an invalid glob is a configuration error.
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| {
                    GateError::MalformedPlan(format!("invalid branch pattern '{}': {}", p, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, branch: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(branch))
    }
}

/// A job's compiled gating policy.
#[derive(Debug, Clone)]
pub struct GatingPolicy {
    triggers: BTreeSet<TriggerKind>,
    labels: LabelPolicy,
    branches: BranchFilter,
}

impl GatingPolicy {
    /// Compile the policy declared by `job`.
    pub fn for_job(job: &JobSpec) -> Result<Self> {
        Ok(Self {
            triggers: job.triggers.clone(),
            labels: job.labels.clone(),
            branches: BranchFilter::new(&job.branches)?,
        })
    }

    /// Decide whether the job runs for `event` given the labels currently on
    /// the associated review request.
    pub fn admit(&self, event: &TriggerEvent, current_labels: &BTreeSet<String>) -> Admission {
        if !self.triggers.is_empty() && !self.triggers.contains(&event.kind) {
            return Admission::Skip(format!("trigger '{}' not enabled", event.kind));
        }

        let label_skip = match event.kind {
            TriggerKind::Dispatch => self.labels.excluded(current_labels),
            _ => match self.labels.evaluate(current_labels) {
                Admission::Admit => None,
                skip => Some(skip),
            },
        };
        if let Some(skip) = label_skip {
            return skip;
        }

        let branch_filtered = matches!(event.kind, TriggerKind::Push | TriggerKind::Dispatch);
        if branch_filtered && !self.branches.is_empty() {
            match event.branch() {
                Some(branch) if self.branches.matches(branch) => {}
                Some(branch) => {
                    return Admission::Skip(format!("branch '{}' not in filter", branch))
                }
                None => {
                    return Admission::Skip(format!(
                        "ref '{}' names no branch for the branch filter",
                        event.git_ref
                    ))
                }
            }
        }

        Admission::Admit
    }
}

/// Evaluate `job`'s gating policy for `event`.
///
/// An uncompilable branch pattern never matches; [`GatingPolicy::for_job`]
/// reports it as a configuration error up front.
pub fn admit(event: &TriggerEvent, job: &JobSpec, current_labels: &BTreeSet<String>) -> Admission {
    match GatingPolicy::for_job(job) {
        Ok(policy) => policy.admit(event, current_labels),
        Err(err) => Admission::Skip(err.to_string()),
    }
}
