//! Events emitted while runs progress.
//!
//! `RunEvent` records each state transition of a run for observability;
//! `TerminalEvent` is what notification collaborators receive once a job's
//! outcome is final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{PipelineRun, RunState, RunWindow};

/// A single run state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    pub run_id: Uuid,
    pub job_id: String,
    pub attempt: u32,

    pub from: RunState,
    pub to: RunState,

    /// Batch sequence number the transition belongs to (1-based, 0 before the first batch)
    pub batch: u64,

    /// Error message for transitions into `Failed`
    pub error: Option<String>,
}

impl RunEvent {
    pub fn transition(run: &PipelineRun, from: RunState, to: RunState) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id: run.id,
            job_id: run.job_id.clone(),
            attempt: run.attempt,
            from,
            to,
            batch: run.batches,
            error: None,
        }
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Final outcome of a job in a window, delivered to notifiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub run_id: Uuid,
    pub job_id: String,

    /// Attempts made, including the last
    pub attempts: u32,

    /// `Succeeded`, `Failed` or `Skipped`
    pub outcome: RunState,

    pub window: RunWindow,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_read: u64,
    pub rows_written: u64,

    /// Summary of the last attempt's error
    pub error_summary: Option<String>,

    /// Short id for correlating with error tracking
    pub error_id: Option<String>,
}

impl TerminalEvent {
    pub fn from_run(run: &PipelineRun) -> Self {
        Self {
            run_id: run.id,
            job_id: run.job_id.clone(),
            attempts: run.attempt,
            outcome: run.state,
            window: run.window.clone(),
            started_at: run.started_at,
            finished_at: run.finished_at,
            rows_read: run.rows_read,
            rows_written: run.rows_written,
            error_summary: run.error_summary(),
            error_id: None,
        }
    }

    pub fn with_error_id(mut self, error_id: Option<String>) -> Self {
        self.error_id = error_id;
        self
    }

    /// One-line human-readable description
    pub fn headline(&self) -> String {
        match (&self.outcome, &self.error_summary) {
            (RunState::Succeeded, _) => format!(
                "Job '{}' succeeded after {} attempt(s): {} rows read, {} written",
                self.job_id, self.attempts, self.rows_read, self.rows_written
            ),
            (state, Some(summary)) => format!(
                "Job '{}' {} after {} attempt(s): {}",
                self.job_id, state, self.attempts, summary
            ),
            (state, None) => format!("Job '{}' {}", self.job_id, state),
        }
    }
}
