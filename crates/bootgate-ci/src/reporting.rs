use anyhow::{Context, Result};
use bootgate_core::{FinalVerdict, Outcome, Report, TriggerEvent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::job::JobReport;

/// Machine-readable outcome of one graph run: the merge-gate artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub trigger: TriggerEvent,
    pub verdict: FinalVerdict,
    /// One entry per job, in declaration order.
    pub summary: Report,
    pub jobs: Vec<JobReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn job(&self, name: &str) -> Option<&JobReport> {
        self.jobs.iter().find(|j| j.job == name)
    }

    /// Process exit code for this run.
    ///
    /// A failing run exits with the class of its first blocking failure, so
    /// a provisioning outage (3) is distinguishable from a test failure (1).
    pub fn exit_code(&self) -> i32 {
        match self.verdict {
            FinalVerdict::Success => 0,
            FinalVerdict::Cancelled => bootgate_core::ErrorClass::Cancelled.exit_code(),
            FinalVerdict::Failure => match self.summary.overall() {
                Outcome::Failed(detail) => detail.kind.class().exit_code(),
                _ => bootgate_core::ErrorClass::TestFailure.exit_code(),
            },
        }
    }
}

/// Write the run report in pretty JSON format.
pub fn write_run_report_json(path: &Path, report: &RunReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

fn outcome_cell(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Passed => "✅ passed".to_string(),
        Outcome::Failed(detail) => format!("❌ failed: {}", detail.message),
        Outcome::Skipped { reason } => format!("⏭️ skipped ({})", reason),
        Outcome::Cancelled => "🚫 cancelled".to_string(),
    }
}

/// Render markdown summary for check output.
pub fn render_run_summary_md(report: &RunReport) -> String {
    let counts = report.summary.counts();
    let mut out = String::new();
    out.push_str(&format!("# bootgate: {}\n\n", report.verdict));
    out.push_str(&format!(
        "- trigger: `{}` on `{}`\n- run: `{}`\n- jobs: {} passed, {} failed, {} skipped, {} cancelled\n\n",
        report.trigger.kind,
        report.trigger.git_ref,
        report.run_id,
        counts.passed,
        counts.failed,
        counts.skipped,
        counts.cancelled
    ));

    out.push_str("| Job | Outcome | Duration |\n|-----|---------|----------|\n");
    for job in &report.jobs {
        let name = if job.blocking {
            job.job.clone()
        } else {
            format!("{} (non-blocking)", job.job)
        };
        out.push_str(&format!(
            "| {} | {} | {:.1}s |\n",
            name,
            outcome_cell(&job.outcome),
            job.duration_ms as f64 / 1000.0
        ));
    }

    let failures: Vec<&JobReport> = report.jobs.iter().filter(|j| j.outcome.is_failed()).collect();
    if !failures.is_empty() {
        out.push_str("\n## Failures\n");
        for job in failures {
            let Some(detail) = job.outcome.failure() else {
                continue;
            };
            out.push_str(&format!("\n### {}\n\n{}\n", job.job, detail.message));
            if !detail.output_tail.is_empty() {
                out.push_str("\n```\n");
                for line in &detail.output_tail {
                    out.push_str(line);
                    out.push('\n');
                }
                out.push_str("```\n");
            }
        }
    }
    out
}
