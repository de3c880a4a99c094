//! Per-step and per-run result records.

use super::step::StepId;
use crate::errors::StepError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Scheduled, not yet started.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Success,
    /// Exhausted retries or hit a non-retriable error.
    Failed,
    /// Never executed: unmet dependency, abort, or cancellation.
    Skipped,
}

impl StepStatus {
    /// Returns true for Success, Failed and Skipped.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// The record of one step's execution. Mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// The step this result belongs to.
    pub step_id: StepId,
    /// Current lifecycle state.
    pub status: StepStatus,
    /// Attempts started by the retry layer.
    pub attempts: usize,
    /// The failure that ended the step, if any.
    pub last_error: Option<StepError>,
    /// When the step entered Running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A fresh pending result for the step.
    #[must_use]
    pub fn pending(step_id: StepId) -> Self {
        Self {
            step_id,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Outcome of an entire run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every step succeeded.
    Success,
    /// Optional failures (or skips caused by them) occurred.
    Partial,
    /// A critical failure, failed health gate, or cancellation ended the run.
    Aborted,
}

impl RunStatus {
    /// Process exit code contract: 0 success, 1 aborted, 2 partial.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Aborted => 1,
            Self::Partial => 2,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Partial => write!(f, "partial"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// The record of one pipeline execution; immutable once finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: Option<DateTime<Utc>>,
    /// Step results in declared order.
    pub step_results: Vec<StepResult>,
    /// Aggregate outcome.
    pub overall: RunStatus,
}

impl RunRecord {
    /// Looks up the result for a step.
    #[must_use]
    pub fn step(&self, id: StepId) -> Option<&StepResult> {
        self.step_results.iter().find(|result| result.step_id == id)
    }

    /// Run duration, when finished.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Renders the user-facing run summary: per-step outcome plus the first
    /// error of each failed step.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut lines = Vec::with_capacity(self.step_results.len() + 1);
        let duration = self
            .duration()
            .map_or_else(String::new, |d| format!(" in {:.1}s", d.num_milliseconds() as f64 / 1000.0));
        lines.push(format!("run {}{} - {}", self.run_id, duration, self.overall));

        for result in &self.step_results {
            let mut line = format!(
                "  {:<16} {:<8} attempts={}",
                result.step_id.to_string(),
                result.status.to_string(),
                result.attempts
            );
            if let Some(error) = &result.last_error {
                line.push_str(&format!("  {error}"));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}
