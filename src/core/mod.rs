//! Core orchestration logic.
//!
//! This module contains:
//! - Connection: Per-source connection pools
//! - Validator: Data quality rule evaluation
//! - Retry: Retry decisions for failed runs
//! - Dependency: Job dependency graph and per-window outcomes
//! - Orchestrator: Single-run extract/validate/transform/load driver
//! - Scheduler: Time and dependency driven dispatch
//! - Schedule: Schedule expression parsing
//! - History: Run history sinks
//! - Tracker: Error tracking

pub mod connection;
pub mod dependency;
pub mod history;
pub mod orchestrator;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod tracker;
pub mod validator;

// Re-export commonly used types
pub use connection::{ConnectionConfig, ConnectionManager, ConnectionPool, PoolError, PooledConnection};
pub use dependency::{DependencyError, DependencyGraph, DependencyManager, Readiness};
pub use history::{open_history, HistoryQuery, JsonlHistory, MemoryHistory, RunHistory, SqliteHistory};
pub use orchestrator::{PipelineOrchestrator, RunObserver};
pub use retry::{RetryDecision, RetryHandler};
pub use schedule::Schedule;
pub use scheduler::{JobScheduler, JobSet, SchedulerBuilder, SchedulerConfig, SchedulerError, SchedulerStatus};
pub use tracker::{ErrorSummary, ErrorTracker};
pub use validator::{DataValidator, LookupResolver};
