//! Adapter interfaces for external systems.
//!
//! The engine depends only on these traits: sources and targets sit behind
//! `Adapter`/`Connection`, transform logic behind `TransformStep`, and
//! terminal outcomes leave through `Notifier`. A `Registry` maps configured
//! names onto implementations.

pub mod jsonl;
pub mod memory;
pub mod notify;
pub mod transforms;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::core::connection::ConnectionConfig;
use crate::core::validator::LookupResolver;
use crate::domain::{RecordBatch, Schema, Value};

pub use jsonl::JsonlAdapter;
pub use memory::MemoryAdapter;
pub use notify::{LogNotifier, MultiNotifier, Notifier, WebhookNotifier};

/// Lazily pulled, finite, non-restartable sequence of batches
pub type BatchStream = BoxStream<'static, Result<RecordBatch, AdapterError>>;

/// Errors reported by adapter implementations
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Worth retrying (network reset, auth timeout, lock contention)
    #[error("transient: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),
}

impl AdapterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::Transient(_))
    }
}

/// What to extract and how to chunk it
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    /// Adapter-specific query
    pub query: String,

    /// Maximum rows per batch
    pub batch_size: usize,

    /// Declared schema, if the job has one
    pub schema: Option<Schema>,

    /// Only rows past this mark are wanted
    pub watermark: Option<Watermark>,
}

impl ExtractRequest {
    pub fn new(query: impl Into<String>, batch_size: usize) -> Self {
        Self {
            query: query.into(),
            batch_size: batch_size.max(1),
            schema: None,
            watermark: None,
        }
    }

    pub fn with_schema(mut self, schema: Option<Schema>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_watermark(mut self, watermark: Option<Watermark>) -> Self {
        self.watermark = watermark;
        self
    }
}

/// Lower bound of an incremental extract (exclusive)
#[derive(Debug, Clone, PartialEq)]
pub struct Watermark {
    pub column: String,
    pub after: Value,
}

impl Watermark {
    pub fn new(column: impl Into<String>, after: Value) -> Self {
        Self {
            column: column.into(),
            after,
        }
    }

    /// Check whether a value lies past the mark; nulls and values of an
    /// incomparable type never do
    pub fn admits(&self, value: &Value) -> bool {
        value.compare(&self.after) == Some(Ordering::Greater)
    }

    /// Keep only the rows past the mark.
    ///
    /// A batch without the column is returned empty.
    pub fn retain(&self, mut batch: RecordBatch) -> RecordBatch {
        let Some(idx) = batch.schema.index_of(&self.column) else {
            return RecordBatch::empty(batch.schema);
        };
        let stale: Vec<usize> = batch
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !row.get(idx).is_some_and(|v| self.admits(v)))
            .map(|(i, _)| i)
            .collect();
        batch.drop_rows(&stale);
        batch
    }
}

/// Trait for source/target drivers
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Open a new connection
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>, AdapterError>;
}

/// An open connection handle
#[async_trait]
pub trait Connection: Send {
    /// Start extracting; batches are produced as the stream is polled
    async fn extract(&mut self, request: &ExtractRequest) -> Result<BatchStream, AdapterError>;

    /// Write one batch, returning the number of rows written
    async fn write_batch(&mut self, table: &str, batch: &RecordBatch) -> Result<usize, AdapterError>;

    /// Health check run when the connection goes back to its pool
    async fn is_healthy(&mut self) -> bool;
}

/// Result of applying a transform step
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub batch: RecordBatch,

    /// Input row indices the step removed on purpose
    pub dropped: Vec<usize>,
}

impl StepOutput {
    pub fn unchanged(batch: RecordBatch) -> Self {
        Self {
            batch,
            dropped: Vec::new(),
        }
    }
}

/// A transform step failure; `rows` names the offending input rows, if known
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    pub rows: Vec<usize>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            rows: Vec::new(),
        }
    }

    pub fn at_rows(message: impl Into<String>, rows: Vec<usize>) -> Self {
        Self {
            message: message.into(),
            rows,
        }
    }
}

/// A transform kind, configured per step through `params`
pub trait TransformStep: Send + Sync {
    fn kind(&self) -> &str;

    fn apply(&self, batch: &RecordBatch, params: &serde_json::Value) -> Result<StepOutput, StepError>;

    /// Check `params` at configuration time
    fn check_params(&self, _params: &serde_json::Value) -> Result<(), String> {
        Ok(())
    }
}

/// Name-to-implementation lookup for adapters, transforms and resolvers
#[derive(Clone, Default)]
pub struct Registry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    transforms: HashMap<String, Arc<dyn TransformStep>>,
    resolvers: HashMap<String, Arc<dyn LookupResolver>>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapters and transforms
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_adapter("memory", Arc::new(MemoryAdapter::new()));
        registry.register_adapter("jsonl", Arc::new(JsonlAdapter));
        for step in transforms::builtin() {
            registry.register_transform(step);
        }
        registry
    }

    pub fn register_adapter(&mut self, name: impl Into<String>, adapter: Arc<dyn Adapter>) -> &mut Self {
        self.adapters.insert(name.into(), adapter);
        self
    }

    pub fn register_transform(&mut self, step: Arc<dyn TransformStep>) -> &mut Self {
        self.transforms.insert(step.kind().to_string(), step);
        self
    }

    pub fn register_resolver(&mut self, name: impl Into<String>, resolver: Arc<dyn LookupResolver>) -> &mut Self {
        self.resolvers.insert(name.into(), resolver);
        self
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn transform(&self, kind: &str) -> Option<Arc<dyn TransformStep>> {
        self.transforms.get(kind).cloned()
    }

    pub fn resolver(&self, name: &str) -> Option<Arc<dyn LookupResolver>> {
        self.resolvers.get(name).cloned()
    }

    pub fn resolvers(&self) -> HashMap<String, Arc<dyn LookupResolver>> {
        self.resolvers.clone()
    }
}
