//! Domain types for the sluice engine.
//!
//! This module contains the core data structures:
//! - Batch: Records and schemas flowing between stages
//! - Job: Job definitions, retry policies and rulesets
//! - Run: Pipeline runs, states and run windows
//! - Events: State transitions and terminal outcomes
//! - Error: Failure taxonomy

pub mod batch;
pub mod error;
pub mod events;
pub mod job;
pub mod run;
pub mod validation;

// Re-export commonly used types
pub use batch::{Column, ColumnType, RecordBatch, Schema, Value};
pub use error::{ErrorKind, PipelineError};
pub use events::{RunEvent, TerminalEvent};
pub use job::{JobDefinition, RetryPolicy, Ruleset, SourceRef, StageRules, StepConfig, TargetRef};
pub use run::{PipelineRun, RunError, RunState, RunWindow, ValidationStage, WindowPolicy};
pub use validation::{Check, Rule, Severity, ValidationResult, Violation};
