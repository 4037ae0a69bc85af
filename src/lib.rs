//! sluice - Dependency-ordered ETL job scheduler
//!
//! Runs configured extract/transform/load jobs on schedules, gated by
//! per-window job dependencies, with pooled connections, data validation
//! between stages and policy-driven retries.
//!
//! # Architecture
//!
//! - A single control loop decides which jobs are due and eligible
//! - A bounded set of workers drives runs through the orchestrator
//! - Each run streams batches: extract, validate, transform, validate, load
//! - Every attempt is appended to run history; final outcomes feed
//!   dependency gating, error tracking and notifications
//!
//! # Modules
//!
//! - `adapters`: Source/target adapters, transform steps, notifiers
//! - `core`: Scheduler, orchestrator, pools, validation, retry, dependencies
//! - `domain`: Data structures (JobDefinition, PipelineRun, RecordBatch)
//! - `config`: Config loading, validation and hot reload
//! - `engine`: Wiring of configuration into components
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run one job now
//! sluice run daily_customers
//!
//! # Inspect recent runs
//! sluice runs --job daily_customers
//!
//! # Run the scheduler, reloading on config changes
//! sluice serve --watch
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod engine;

// Re-export main types at crate root for convenience
pub use config::Config;
pub use core::{JobScheduler, PipelineOrchestrator};
pub use domain::{JobDefinition, PipelineRun, RecordBatch, RunState};
pub use engine::Engine;
