//! Error tracking across runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::error;
use uuid::Uuid;

use crate::domain::{ErrorKind, RunError};

/// Entries retained for the summary
const MAX_ENTRIES: usize = 1000;

/// Entries shown as "recent" in a summary
const RECENT_ENTRIES: usize = 10;

/// Error tracking settings (`settings.error_tracking`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Total error count at which an alert is logged
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: u64,
}

fn default_alert_threshold() -> u64 {
    10
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            alert_threshold: default_alert_threshold(),
        }
    }
}

/// A tracked failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub error_id: String,
    pub timestamp: DateTime<Utc>,
    pub job_id: String,
    pub run_id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
}

/// Snapshot of tracked errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub total: u64,
    pub by_kind: BTreeMap<ErrorKind, u64>,

    /// Most recent entries, newest last
    pub recent: Vec<ErrorEntry>,

    pub threshold_exceeded: bool,
}

#[derive(Default)]
struct TrackerState {
    total: u64,
    by_kind: BTreeMap<ErrorKind, u64>,
    entries: VecDeque<ErrorEntry>,
    alerted: bool,
}

/// Counts run failures by kind and raises a single alert past a threshold
pub struct ErrorTracker {
    settings: TrackerSettings,
    state: Mutex<TrackerState>,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new(TrackerSettings::default())
    }
}

impl ErrorTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Track a failure and return its error id
    pub fn track(&self, job_id: &str, run_id: Uuid, err: &RunError) -> String {
        let timestamp = Utc::now();
        let error_id = error_id(timestamp, err.kind, &err.message);

        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        state.total += 1;
        *state.by_kind.entry(err.kind).or_default() += 1;
        if state.entries.len() == MAX_ENTRIES {
            state.entries.pop_front();
        }
        state.entries.push_back(ErrorEntry {
            error_id: error_id.clone(),
            timestamp,
            job_id: job_id.to_string(),
            run_id,
            kind: err.kind,
            message: err.message.clone(),
        });

        if !state.alerted && state.total >= self.settings.alert_threshold {
            state.alerted = true;
            error!(
                total = state.total,
                threshold = self.settings.alert_threshold,
                %error_id,
                "Error threshold exceeded"
            );
        }

        error_id
    }

    pub fn summary(&self) -> ErrorSummary {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let skip = state.entries.len().saturating_sub(RECENT_ENTRIES);
        ErrorSummary {
            total: state.total,
            by_kind: state.by_kind.clone(),
            recent: state.entries.iter().skip(skip).cloned().collect(),
            threshold_exceeded: state.total >= self.settings.alert_threshold,
        }
    }
}

/// First 8 hex chars of SHA-256 over `timestamp|kind|message`
pub fn error_id(timestamp: DateTime<Utc>, kind: ErrorKind, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", timestamp.to_rfc3339(), kind, message).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_id_shape() {
        let id = error_id(Utc::now(), ErrorKind::Load, "disk full");
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_summary_counts_by_kind() {
        let tracker = ErrorTracker::new(TrackerSettings { alert_threshold: 3 });
        let run_id = Uuid::new_v4();

        tracker.track("orders", run_id, &RunError::new(ErrorKind::Load, "disk full"));
        tracker.track("orders", run_id, &RunError::new(ErrorKind::Load, "disk full"));
        let summary = tracker.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.by_kind[&ErrorKind::Load], 2);
        assert!(!summary.threshold_exceeded);

        tracker.track("customers", run_id, &RunError::new(ErrorKind::Validation, "null email"));
        let summary = tracker.summary();
        assert!(summary.threshold_exceeded);
        assert_eq!(summary.recent.last().unwrap().job_id, "customers");
    }

    #[test]
    fn test_recent_is_bounded() {
        let tracker = ErrorTracker::default();
        for i in 0..25 {
            tracker.track("j", Uuid::new_v4(), &RunError::new(ErrorKind::Extract, format!("e{}", i)));
        }
        let summary = tracker.summary();
        assert_eq!(summary.recent.len(), RECENT_ENTRIES);
        assert_eq!(summary.recent.last().unwrap().message, "e24");
    }
}
