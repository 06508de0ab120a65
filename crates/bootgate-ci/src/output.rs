//! Live step output: bounded tails and observers.

use std::collections::VecDeque;
use std::fmt;

use bootgate_core::{Outcome, ScriptStep};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stream::Stdout => f.write_str("stdout"),
            Stream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Receives step lifecycle events and output lines as they happen.
///
/// `subject` is the job (or plan) the step belongs to.
pub trait StepObserver: Send + Sync {
    fn step_started(&self, _subject: &str, _step: &ScriptStep, _index: usize, _total: usize) {}

    fn line(&self, subject: &str, step: &ScriptStep, stream: Stream, line: &str);

    fn step_finished(&self, _subject: &str, _step: &ScriptStep, _outcome: &Outcome) {}
}

/// Logs everything through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StepObserver for TracingObserver {
    fn step_started(&self, subject: &str, step: &ScriptStep, index: usize, total: usize) {
        info!(job = %subject, step = %step.name, index = index + 1, total, "Executing step");
    }

    fn line(&self, subject: &str, step: &ScriptStep, stream: Stream, line: &str) {
        debug!(job = %subject, step = %step.name, %stream, "{}", line);
    }

    fn step_finished(&self, subject: &str, step: &ScriptStep, outcome: &Outcome) {
        info!(job = %subject, step = %step.name, outcome = outcome.label(), "Step finished");
    }
}

/// Keeps the last `max_lines` lines, each cut to `max_line_bytes`.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    max_lines: usize,
    max_line_bytes: usize,
}

impl OutputTail {
    pub fn new(max_lines: usize, max_line_bytes: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines.min(64)),
            max_lines,
            max_line_bytes,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.max_lines == 0 {
            return;
        }
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
        }
        self.lines.push_back(truncate_at_char_boundary(line, self.max_line_bytes));
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

fn truncate_at_char_boundary(line: &str, max_bytes: usize) -> String {
    if line.len() <= max_bytes {
        return line.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    line[..end].to_string()
}
