//! Result aggregation store. Each job's report is written exactly once.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::JobReport;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("job '{job}' already reported for run {run_id}")]
    AlreadyReported { run_id: String, job: String },
}

/// Sink for per-job reports, keyed by run.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Record `report` for `run_id`. A second write for the same job fails.
    async fn put(&self, run_id: &str, report: JobReport) -> Result<(), StoreError>;

    async fn get(&self, run_id: &str, job: &str) -> Option<JobReport>;

    /// Reports for `run_id` in write order.
    async fn list(&self, run_id: &str) -> Vec<JobReport>;
}

/// In-memory store backed by a `HashMap<run_id, Vec<JobReport>>`.
#[derive(Debug, Default)]
pub struct MemoryReportStore {
    runs: Mutex<HashMap<String, Vec<JobReport>>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn put(&self, run_id: &str, report: JobReport) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        let reports = runs.entry(run_id.to_string()).or_default();
        if reports.iter().any(|r| r.job == report.job) {
            return Err(StoreError::AlreadyReported {
                run_id: run_id.to_string(),
                job: report.job,
            });
        }
        reports.push(report);
        Ok(())
    }

    async fn get(&self, run_id: &str, job: &str) -> Option<JobReport> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.get(run_id)?.iter().find(|r| r.job == job).cloned()
    }

    async fn list(&self, run_id: &str) -> Vec<JobReport> {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.get(run_id).cloned().unwrap_or_default()
    }
}
