//! Error taxonomy shared by the orchestrator, retry handler and scheduler.
//!
//! Stage-level failures are classified into a `PipelineError` at the
//! orchestrator boundary; only the `ErrorKind` and message survive into the
//! run record.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::run::ValidationStage;

/// Classification of a run failure, used for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Could not open or keep a connection
    Connection,

    /// No pooled connection became free before the acquire timeout
    PoolExhausted,

    /// The source stream failed mid-extraction
    Extract,

    /// A fail-severity data quality rule was violated
    Validation,

    /// A transform step failed and was not marked skip-on-error
    Transformation,

    /// Writing a batch to the target failed
    Load,

    /// A prerequisite job did not succeed in the run window
    Dependency,

    /// The dependency graph contains a cycle
    Cycle,

    /// The job references something the configuration does not define
    Configuration,

    /// The run was cancelled externally
    Cancelled,
}

impl ErrorKind {
    /// Kind used when matching against a retry policy.
    ///
    /// Pool exhaustion is a connection failure for retry purposes.
    pub fn retry_class(self) -> ErrorKind {
        match self {
            ErrorKind::PoolExhausted => ErrorKind::Connection,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::Extract => "extract",
            ErrorKind::Validation => "validation",
            ErrorKind::Transformation => "transformation",
            ErrorKind::Load => "load",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Cycle => "cycle",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure of one pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("connection to '{source_id}' failed after {attempts} attempt(s): {message}")]
    Connection {
        source_id: String,
        attempts: u32,
        message: String,
    },

    #[error("connection pool for '{source_id}' exhausted after waiting {waited_ms}ms")]
    PoolExhausted { source_id: String, waited_ms: u64 },

    #[error("extract from '{source_id}' failed: {message}")]
    Extract { source_id: String, message: String },

    #[error("validation failed at {stage} with {violations} violation(s): {message}")]
    Validation {
        stage: ValidationStage,
        violations: usize,
        message: String,
    },

    #[error("transform step '{step}' failed: {message}")]
    Transformation { step: String, message: String },

    #[error("load into '{target}' failed: {message}")]
    Load { target: String, message: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Connection { .. } => ErrorKind::Connection,
            PipelineError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            PipelineError::Extract { .. } => ErrorKind::Extract,
            PipelineError::Validation { .. } => ErrorKind::Validation,
            PipelineError::Transformation { .. } => ErrorKind::Transformation,
            PipelineError::Load { .. } => ErrorKind::Load,
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_exhausted_retries_as_connection() {
        assert_eq!(ErrorKind::PoolExhausted.retry_class(), ErrorKind::Connection);
        assert_eq!(ErrorKind::Load.retry_class(), ErrorKind::Load);
    }

    #[test]
    fn test_error_kind_serialization() {
        let json = serde_json::to_string(&ErrorKind::PoolExhausted).unwrap();
        assert_eq!(json, "\"pool_exhausted\"");

        let kinds: Vec<ErrorKind> = serde_yaml::from_str("[connection, load]").unwrap();
        assert_eq!(kinds, vec![ErrorKind::Connection, ErrorKind::Load]);
    }

    #[test]
    fn test_pipeline_error_kind() {
        let err = PipelineError::Validation {
            stage: ValidationStage::PostExtract,
            violations: 2,
            message: "null in 'email'".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("post_extract"));
    }
}
