//! In-memory source/target adapter.
//!
//! Source tables are preloaded batches; written rows are kept per table.
//! Failure injection knobs make it usable for exercising retry paths.
//!
//! A table's row count is its metadata: every extracted batch carries the
//! count it was stored with, and `declare_row_count` lets a table promise
//! more (or fewer) rows than it holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use super::{Adapter, AdapterError, BatchStream, Connection, ExtractRequest};
use crate::core::connection::ConnectionConfig;
use crate::domain::{RecordBatch, Value};

#[derive(Default)]
struct MemoryInner {
    tables: Mutex<HashMap<String, Vec<RecordBatch>>>,
    written: Mutex<HashMap<String, Vec<Vec<Value>>>>,
    open_now: AtomicUsize,
    peak_open: AtomicUsize,
    opened_total: AtomicUsize,
    fail_connects: AtomicUsize,
    fail_writes: AtomicUsize,
    fail_extract_after: Mutex<HashMap<String, usize>>,
    stall_extract_after: Mutex<HashMap<String, usize>>,
    stall_writes: AtomicUsize,
    declared_rows: Mutex<HashMap<String, usize>>,
    unhealthy: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Decrement a counter if positive, returning whether it was
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Adapter over process memory; clones share state
#[derive(Clone, Default)]
pub struct MemoryAdapter {
    inner: Arc<MemoryInner>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `name` extractable; batches are replayed as given on every extract
    pub fn load_table(&self, name: impl Into<String>, batches: Vec<RecordBatch>) {
        lock(&self.inner.tables).insert(name.into(), batches);
    }

    /// Add batches to the end of `name`, creating it if needed
    pub fn append_batches(&self, name: impl Into<String>, batches: Vec<RecordBatch>) {
        lock(&self.inner.tables).entry(name.into()).or_default().extend(batches);
    }

    /// Promise `rows` rows for `table` regardless of what it holds
    pub fn declare_row_count(&self, table: impl Into<String>, rows: usize) {
        lock(&self.inner.declared_rows).insert(table.into(), rows);
    }

    /// Rows written to `table` so far
    pub fn written_rows(&self, table: &str) -> Vec<Vec<Value>> {
        lock(&self.inner.written).get(table).cloned().unwrap_or_default()
    }

    /// Most connections open at the same time
    pub fn peak_open(&self) -> usize {
        self.inner.peak_open.load(Ordering::SeqCst)
    }

    pub fn open_now(&self) -> usize {
        self.inner.open_now.load(Ordering::SeqCst)
    }

    /// Connections opened over the adapter's lifetime
    pub fn opened_total(&self) -> usize {
        self.inner.opened_total.load(Ordering::SeqCst)
    }

    /// Fail the next `n` connection attempts with a transient error
    pub fn fail_connects(&self, n: usize) {
        self.inner.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` batch writes with a transient error
    pub fn fail_writes(&self, n: usize) {
        self.inner.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Make the extract stream for `table` fail after yielding `batches` batches
    pub fn fail_extract_after(&self, table: impl Into<String>, batches: usize) {
        lock(&self.inner.fail_extract_after).insert(table.into(), batches);
    }

    /// Make the extract stream for `table` hang after yielding `batches` batches
    pub fn stall_extract_after(&self, table: impl Into<String>, batches: usize) {
        lock(&self.inner.stall_extract_after).insert(table.into(), batches);
    }

    /// Make the next `n` batch writes hang
    pub fn stall_writes(&self, n: usize) {
        self.inner.stall_writes.store(n, Ordering::SeqCst);
    }

    /// Report every connection as unhealthy on release
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.inner.unhealthy.store(unhealthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl Adapter for MemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>, AdapterError> {
        if take_one(&self.inner.fail_connects) {
            return Err(AdapterError::Transient("connection refused".to_string()));
        }

        let open = self.inner.open_now.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_open.fetch_max(open, Ordering::SeqCst);
        self.inner.opened_total.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<MemoryInner>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.inner.open_now.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn extract(&mut self, request: &ExtractRequest) -> Result<BatchStream, AdapterError> {
        let mut batches = lock(&self.inner.tables)
            .get(&request.query)
            .cloned()
            .ok_or_else(|| AdapterError::Permanent(format!("no such table '{}'", request.query)))?;

        match &request.watermark {
            Some(mark) => {
                batches = batches.into_iter().map(|b| mark.retain(b)).collect();
            }
            None => {
                let declared = lock(&self.inner.declared_rows).get(&request.query).copied();
                stamp_expected_rows(&mut batches, declared);
            }
        }

        if let Some(n) = lock(&self.inner.stall_extract_after).get(&request.query).copied() {
            let head: Vec<Result<RecordBatch, AdapterError>> = batches.into_iter().take(n).map(Ok).collect();
            return Ok(stream::iter(head).chain(stream::pending()).boxed());
        }

        let fail_after = lock(&self.inner.fail_extract_after).get(&request.query).copied();
        let items: Vec<Result<RecordBatch, AdapterError>> = match fail_after {
            Some(n) => batches
                .into_iter()
                .take(n)
                .map(Ok)
                .chain(std::iter::once(Err(AdapterError::Transient(
                    "source stream reset".to_string(),
                ))))
                .collect(),
            None => batches.into_iter().map(Ok).collect(),
        };

        Ok(stream::iter(items).boxed())
    }

    async fn write_batch(&mut self, table: &str, batch: &RecordBatch) -> Result<usize, AdapterError> {
        if take_one(&self.inner.fail_writes) {
            return Err(AdapterError::Transient("write timed out".to_string()));
        }
        if take_one(&self.inner.stall_writes) {
            futures::future::pending::<()>().await;
        }

        lock(&self.inner.written)
            .entry(table.to_string())
            .or_default()
            .extend(batch.rows.iter().cloned());
        Ok(batch.num_rows())
    }

    async fn is_healthy(&mut self) -> bool {
        !self.inner.unhealthy.load(Ordering::SeqCst)
    }
}

/// Give each batch the row count it was stored with; the last batch absorbs
/// any difference between the stored rows and the declared total
fn stamp_expected_rows(batches: &mut [RecordBatch], declared: Option<usize>) {
    let stored: usize = batches.iter().map(RecordBatch::num_rows).sum();
    let last = batches.len().saturating_sub(1);
    for (i, batch) in batches.iter_mut().enumerate() {
        if batch.expected_rows.is_some() {
            continue;
        }
        let rows = batch.num_rows();
        let expected = match declared {
            Some(total) if i == last => (total + rows).saturating_sub(stored),
            _ => rows,
        };
        batch.expected_rows = Some(expected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::Watermark;
    use crate::domain::{Column, ColumnType, Schema};
    use futures::TryStreamExt;

    fn batch(ids: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Column::new("id", ColumnType::Int)]));
        RecordBatch::new(schema, ids.iter().map(|&i| vec![Value::Int(i)]).collect())
    }

    fn request(query: &str) -> ExtractRequest {
        ExtractRequest::new(query, 10)
    }

    #[tokio::test]
    async fn test_extract_and_write() {
        let adapter = MemoryAdapter::new();
        adapter.load_table("numbers", vec![batch(&[1, 2]), batch(&[3])]);

        let mut conn = adapter.open(&ConnectionConfig::new("memory")).await.unwrap();
        let batches: Vec<RecordBatch> = conn.extract(&request("numbers")).await.unwrap().try_collect().await.unwrap();
        assert_eq!(batches.len(), 2);

        let written = conn.write_batch("sink", &batches[0]).await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(adapter.written_rows("sink").len(), 2);
    }

    #[tokio::test]
    async fn test_open_counters() {
        let adapter = MemoryAdapter::new();
        let config = ConnectionConfig::new("memory");

        let a = adapter.open(&config).await.unwrap();
        let b = adapter.open(&config).await.unwrap();
        assert_eq!(adapter.open_now(), 2);
        drop(a);
        drop(b);

        assert_eq!(adapter.open_now(), 0);
        assert_eq!(adapter.peak_open(), 2);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let adapter = MemoryAdapter::new();
        adapter.fail_connects(1);
        let config = ConnectionConfig::new("memory");

        let err = adapter.open(&config).await.err().unwrap();
        assert!(err.is_transient());

        let mut conn = adapter.open(&config).await.unwrap();
        assert!(conn.extract(&request("missing")).await.is_err());

        adapter.load_table("numbers", vec![batch(&[1]), batch(&[2])]);
        adapter.fail_extract_after("numbers", 1);
        let results: Vec<_> = conn.extract(&request("numbers")).await.unwrap().collect().await;
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_batches_carry_row_counts() {
        let adapter = MemoryAdapter::new();
        adapter.load_table("numbers", vec![batch(&[1, 2]), batch(&[3])]);
        let mut conn = adapter.open(&ConnectionConfig::new("memory")).await.unwrap();

        let batches: Vec<RecordBatch> = conn.extract(&request("numbers")).await.unwrap().try_collect().await.unwrap();
        assert_eq!(batches[0].expected_rows, Some(2));
        assert_eq!(batches[1].expected_rows, Some(1));

        // Source claims more rows than it delivers: the shortfall lands on the last batch
        adapter.declare_row_count("numbers", 5);
        let batches: Vec<RecordBatch> = conn.extract(&request("numbers")).await.unwrap().try_collect().await.unwrap();
        assert_eq!(batches[0].expected_rows, Some(2));
        assert_eq!(batches[1].expected_rows, Some(3));
    }

    #[tokio::test]
    async fn test_watermark_filters_rows() {
        let adapter = MemoryAdapter::new();
        adapter.load_table("numbers", vec![batch(&[1, 2]), batch(&[3, 4])]);
        let mut conn = adapter.open(&ConnectionConfig::new("memory")).await.unwrap();

        let req = request("numbers").with_watermark(Some(Watermark::new("id", Value::Int(2))));
        let batches: Vec<RecordBatch> = conn.extract(&req).await.unwrap().try_collect().await.unwrap();
        let ids: Vec<Value> = batches.iter().flat_map(|b| b.rows.iter().map(|r| r[0].clone())).collect();

        assert_eq!(ids, vec![Value::Int(3), Value::Int(4)]);
        assert!(batches.iter().all(|b| b.expected_rows.is_none()));
    }
}
