//! Run state and the run window.
//!
//! A `PipelineRun` represents one execution attempt of a job. It is created
//! by the scheduler, owned by the orchestrator until terminal, then handed to
//! run history as a read-only snapshot.

use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::batch::Value;
use super::error::{ErrorKind, PipelineError};
use super::job::{JobDefinition, RetryPolicy};
use super::validation::Violation;

/// Violations kept on the run record; the rest are only counted
pub const MAX_RECORDED_VIOLATIONS: usize = 100;

/// One execution attempt of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier for this run
    pub id: Uuid,

    pub job_id: String,

    /// 1-based attempt number
    pub attempt: u32,

    pub state: RunState,

    /// Window in which dependency outcomes are compared
    pub window: RunWindow,

    pub created_at: DateTime<Utc>,

    /// When the orchestrator picked the run up
    pub started_at: Option<DateTime<Utc>>,

    /// When the run reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,

    pub rows_read: u64,
    pub rows_written: u64,

    /// Rows removed by transform steps
    pub rows_dropped: u64,

    pub batches: u64,

    /// Number of warn-severity violations seen
    pub warnings: u64,

    /// First violations seen (warn and fail)
    #[serde(default)]
    pub violations: Vec<Violation>,

    pub last_error: Option<RunError>,

    /// Runs of satisfied prerequisites that made this run eligible
    #[serde(default)]
    pub triggered_by: Vec<Uuid>,

    /// Policy copied from the job at creation
    pub retry_policy: RetryPolicy,

    /// Incremental mark this run extracted after
    #[serde(default)]
    pub watermark_from: Option<Value>,

    /// Greatest incremental column value seen, carried forward from
    /// `watermark_from` when the run read nothing newer
    #[serde(default)]
    pub high_water_mark: Option<Value>,
}

impl PipelineRun {
    /// Create a pending run for a job
    pub fn new(job: &JobDefinition, attempt: u32, window: RunWindow) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id.clone(),
            attempt: attempt.max(1),
            state: RunState::Pending,
            window,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            rows_read: 0,
            rows_written: 0,
            rows_dropped: 0,
            batches: 0,
            warnings: 0,
            violations: Vec::new(),
            last_error: None,
            triggered_by: Vec::new(),
            retry_policy: job.retry.clone(),
            watermark_from: None,
            high_water_mark: None,
        }
    }

    /// Create the terminal record of a job that was skipped in a window
    pub fn skipped(job: &JobDefinition, window: RunWindow, reason: impl Into<String>) -> Self {
        let mut run = Self::new(job, 1, window);
        let now = Utc::now();
        run.state = RunState::Skipped;
        run.finished_at = Some(now);
        run.last_error = Some(RunError::new(ErrorKind::Dependency, reason));
        run
    }

    /// Create the run for the next attempt of this job
    pub fn next_attempt(&self, job: &JobDefinition) -> Self {
        let mut run = Self::new(job, self.attempt + 1, self.window.clone());
        run.triggered_by = self.triggered_by.clone();
        run
    }

    pub fn with_triggers(mut self, triggered_by: Vec<Uuid>) -> Self {
        self.triggered_by = triggered_by;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Record a validation violation, keeping at most `MAX_RECORDED_VIOLATIONS`
    pub fn record_violation(&mut self, violation: Violation) {
        if violation.severity == super::validation::Severity::Warn {
            self.warnings += 1;
        }
        if self.violations.len() < MAX_RECORDED_VIOLATIONS {
            self.violations.push(violation);
        }
    }

    /// Wall-clock duration, once finished
    pub fn duration(&self) -> Option<ChronoDuration> {
        Some(self.finished_at? - self.started_at?)
    }

    /// Human-readable error summary for terminal failures
    pub fn error_summary(&self) -> Option<String> {
        self.last_error
            .as_ref()
            .map(|e| format!("{}: {}", e.kind, e.message))
    }
}

/// Error kind and message of the last failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&PipelineError> for RunError {
    fn from(err: &PipelineError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Which validation gate a batch is at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    PostExtract,
    PostTransform,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStage::PostExtract => f.write_str("post_extract"),
            ValidationStage::PostTransform => f.write_str("post_transform"),
        }
    }
}

/// State of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, not yet picked up
    Pending,

    /// Pulling the next batch from the source
    Extracting,

    /// Checking a batch against a rule set
    Validating(ValidationStage),

    /// Running the transform chain on a batch
    Transforming,

    /// Writing a batch to the target
    Loading,

    /// Completed successfully
    Succeeded,

    /// Failed with an unrecoverable stage error
    Failed,

    /// Cancelled externally
    Aborted,

    /// Never ran because a prerequisite did not succeed
    Skipped,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::Aborted | RunState::Skipped
        )
    }

    /// Check whether the state machine allows moving to `next`.
    ///
    /// Batches cycle Extracting -> ... -> Loading -> Extracting until the
    /// source is drained.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        use ValidationStage::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Failed) | (_, Aborted) => true,
            (Pending, Extracting) | (Pending, Skipped) => true,
            (Extracting, Validating(PostExtract)) => true,
            (Extracting, Succeeded) => true,
            (Validating(PostExtract), Transforming) => true,
            (Transforming, Validating(PostTransform)) => true,
            (Validating(PostTransform), Loading) => true,
            (Loading, Extracting) | (Loading, Succeeded) => true,
            _ => false,
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Pending => f.write_str("pending"),
            RunState::Extracting => f.write_str("extracting"),
            RunState::Validating(stage) => write!(f, "validating({})", stage),
            RunState::Transforming => f.write_str("transforming"),
            RunState::Loading => f.write_str("loading"),
            RunState::Succeeded => f.write_str("succeeded"),
            RunState::Failed => f.write_str("failed"),
            RunState::Aborted => f.write_str("aborted"),
            RunState::Skipped => f.write_str("skipped"),
        }
    }
}

/// Scheduling period within which dependency outcomes are compared
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunWindow(String);

impl RunWindow {
    /// Use an explicit window id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How fire times map onto run windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowPolicy {
    /// One window per UTC calendar day
    #[default]
    Daily,

    /// One window per UTC hour
    Hourly,
}

impl WindowPolicy {
    /// Window containing the given instant.
    ///
    /// Window ids sort chronologically as strings.
    pub fn window_for(&self, at: DateTime<Utc>) -> RunWindow {
        match self {
            WindowPolicy::Daily => RunWindow(at.format("%Y-%m-%d").to_string()),
            WindowPolicy::Hourly => RunWindow(format!("{}T{:02}", at.format("%Y-%m-%d"), at.hour())),
        }
    }
}
