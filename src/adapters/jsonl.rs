//! Newline-delimited JSON file adapter.
//!
//! A connection points at a directory (`options.dir`). Extracting query `q`
//! streams objects from `{dir}/q.jsonl`; writing to table `t` appends
//! objects to `{dir}/t.jsonl`.
//!
//! An optional `{dir}/q.manifest.json` (`{"rows": N}`) declares how many rows
//! the file should hold. Batches then carry the count they were promised, and
//! a short file ends with an empty batch carrying the shortfall.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Deserialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};

use super::{Adapter, AdapterError, BatchStream, Connection, ExtractRequest, Watermark};
use crate::core::connection::ConnectionConfig;
use crate::domain::{Column, ColumnType, RecordBatch, Schema, Value};

/// Adapter for JSONL files in a directory
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonlAdapter;

#[async_trait]
impl Adapter for JsonlAdapter {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>, AdapterError> {
        let dir = config
            .options
            .get("dir")
            .and_then(|d| d.as_str())
            .ok_or_else(|| AdapterError::Permanent("jsonl connection needs options.dir".to_string()))?;
        let dir = PathBuf::from(dir);

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| AdapterError::Transient(format!("cannot open {}: {}", dir.display(), e)))?;

        Ok(Box::new(JsonlConnection { dir }))
    }
}

struct JsonlConnection {
    dir: PathBuf,
}

impl JsonlConnection {
    fn file_for(&self, name: &str) -> Result<PathBuf, AdapterError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(AdapterError::Permanent(format!("invalid table name '{}'", name)));
        }
        Ok(self.dir.join(format!("{}.jsonl", name)))
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    rows: usize,
}

async fn read_manifest(path: &Path) -> Result<Option<Manifest>, AdapterError> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AdapterError::Transient(format!("cannot read {}: {}", path.display(), e))),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| AdapterError::Permanent(format!("{}: {}", path.display(), e)))
}

struct ReadState {
    lines: Lines<BufReader<File>>,
    schema: Option<Arc<Schema>>,
    batch_size: usize,
    line_no: usize,
    watermark: Option<Watermark>,
    /// Rows the manifest still promises
    remaining: Option<usize>,
    done: bool,
}

impl ReadState {
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>, AdapterError> {
        loop {
            let Some(batch) = self.read_batch().await? else {
                return Ok(self.shortfall());
            };

            if let Some(mark) = &self.watermark {
                let batch = mark.retain(batch);
                if batch.is_empty() {
                    continue;
                }
                return Ok(Some(batch));
            }

            return Ok(Some(match self.remaining.as_mut() {
                Some(remaining) => {
                    let expected = (*remaining).min(self.batch_size);
                    *remaining = remaining.saturating_sub(batch.num_rows());
                    batch.with_expected_rows(expected)
                }
                None => batch,
            }));
        }
    }

    fn shortfall(&mut self) -> Option<RecordBatch> {
        let missing = self.remaining.take().filter(|n| *n > 0)?;
        let schema = self.schema.clone().unwrap_or_else(|| Arc::new(Schema::default()));
        Some(RecordBatch::empty(schema).with_expected_rows(missing))
    }

    async fn read_batch(&mut self) -> Result<Option<RecordBatch>, AdapterError> {
        let mut objects = Vec::with_capacity(self.batch_size);

        while objects.len() < self.batch_size {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| AdapterError::Transient(format!("read failed: {}", e)))?;
            let Some(line) = line else { break };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let parsed: serde_json::Value = serde_json::from_str(&line)
                .map_err(|e| AdapterError::Permanent(format!("line {}: {}", self.line_no, e)))?;
            match parsed {
                serde_json::Value::Object(map) => objects.push(map),
                _ => {
                    return Err(AdapterError::Permanent(format!(
                        "line {}: expected a JSON object",
                        self.line_no
                    )))
                }
            }
        }

        if objects.is_empty() {
            return Ok(None);
        }

        let schema = match &self.schema {
            Some(schema) => Arc::clone(schema),
            None => {
                let inferred = Arc::new(infer_schema(&objects[0]));
                self.schema = Some(Arc::clone(&inferred));
                inferred
            }
        };

        let rows = objects
            .iter()
            .map(|object| {
                schema
                    .columns
                    .iter()
                    .map(|column| {
                        object
                            .get(&column.name)
                            .map_or(Value::Null, |v| json_to_value(v, column.ty))
                    })
                    .collect()
            })
            .collect();

        Ok(Some(RecordBatch::new(schema, rows)))
    }
}

/// Column set of the first object; nulls are typed as text
fn infer_schema(object: &serde_json::Map<String, serde_json::Value>) -> Schema {
    let columns = object
        .iter()
        .map(|(name, value)| {
            let ty = match value {
                serde_json::Value::Bool(_) => ColumnType::Bool,
                serde_json::Value::Number(n) if n.is_i64() => ColumnType::Int,
                serde_json::Value::Number(_) => ColumnType::Float,
                _ => ColumnType::Text,
            };
            Column::new(name.clone(), ty)
        })
        .collect();
    Schema::new(columns)
}

/// Convert a JSON value, keeping mismatches visible to type validation
fn json_to_value(value: &serde_json::Value, ty: ColumnType) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) if ty != ColumnType::Float => Value::Int(i),
            _ => n.as_f64().map_or(Value::Null, Value::Float),
        },
        serde_json::Value::String(s) if ty == ColumnType::Timestamp => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => Value::Timestamp(ts.with_timezone(&Utc)),
            Err(_) => Value::Text(s.clone()),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => Value::Text(other.to_string()),
    }
}

#[async_trait]
impl Connection for JsonlConnection {
    async fn extract(&mut self, request: &ExtractRequest) -> Result<BatchStream, AdapterError> {
        let path = self.file_for(&request.query)?;
        let file = File::open(&path)
            .await
            .map_err(|e| AdapterError::Permanent(format!("cannot open {}: {}", path.display(), e)))?;

        let remaining = match &request.watermark {
            Some(_) => None,
            None => read_manifest(&self.dir.join(format!("{}.manifest.json", request.query)))
                .await?
                .map(|m| m.rows),
        };

        let state = ReadState {
            lines: BufReader::new(file).lines(),
            schema: request.schema.clone().map(Arc::new),
            batch_size: request.batch_size.max(1),
            line_no: 0,
            watermark: request.watermark.clone(),
            remaining,
            done: false,
        };

        let batches = stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            match state.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), state)),
                Ok(None) => None,
                Err(e) => {
                    state.done = true;
                    Some((Err(e), state))
                }
            }
        });

        Ok(batches.boxed())
    }

    async fn write_batch(&mut self, table: &str, batch: &RecordBatch) -> Result<usize, AdapterError> {
        let path = self.file_for(table)?;

        let mut buffer = String::new();
        for row in &batch.rows {
            let object: serde_json::Map<String, serde_json::Value> = batch
                .schema
                .columns
                .iter()
                .zip(row)
                .map(|(column, value)| {
                    let json = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
                    (column.name.clone(), json)
                })
                .collect();
            let line = serde_json::to_string(&object)
                .map_err(|e| AdapterError::Permanent(format!("cannot encode row: {}", e)))?;
            buffer.push_str(&line);
            buffer.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AdapterError::Transient(format!("cannot open {}: {}", path.display(), e)))?;
        file.write_all(buffer.as_bytes())
            .await
            .map_err(|e| AdapterError::Transient(format!("write failed: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| AdapterError::Transient(format!("flush failed: {}", e)))?;

        Ok(batch.num_rows())
    }

    async fn is_healthy(&mut self) -> bool {
        tokio::fs::metadata(&self.dir).await.map(|m| m.is_dir()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ConnectionConfig {
        ConnectionConfig::new("jsonl").with_options(json!({ "dir": dir.path() }))
    }

    #[tokio::test]
    async fn test_extract_in_batches() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = (1..=5)
            .map(|i| json!({ "id": i, "name": format!("c{}", i) }).to_string())
            .collect();
        std::fs::write(dir.path().join("customers.jsonl"), lines.join("\n")).unwrap();

        let mut conn = JsonlAdapter.open(&config(&dir)).await.unwrap();
        let request = ExtractRequest::new("customers", 2);
        let batches: Vec<RecordBatch> = conn.extract(&request).await.unwrap().try_collect().await.unwrap();

        assert_eq!(batches.iter().map(|b| b.num_rows()).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(batches[0].value(0, "id"), Some(&Value::Int(1)));
        assert_eq!(batches[2].value(0, "name"), Some(&Value::from("c5")));
    }

    #[tokio::test]
    async fn test_declared_schema_and_write() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("events.jsonl"),
            "{\"at\": \"2026-10-19T07:00:00Z\", \"n\": 1}\n{\"at\": \"yesterday\"}\n",
        )
        .unwrap();

        let schema = Schema::new(vec![
            Column::new("at", ColumnType::Timestamp),
            Column::new("n", ColumnType::Float),
        ]);
        let mut conn = JsonlAdapter.open(&config(&dir)).await.unwrap();
        let request = ExtractRequest::new("events", 10).with_schema(Some(schema));
        let batches: Vec<RecordBatch> = conn.extract(&request).await.unwrap().try_collect().await.unwrap();
        let batch = &batches[0];

        assert!(matches!(batch.value(0, "at"), Some(Value::Timestamp(_))));
        assert_eq!(batch.value(0, "n"), Some(&Value::Float(1.0)));
        assert_eq!(batch.value(1, "at"), Some(&Value::from("yesterday")));
        assert_eq!(batch.value(1, "n"), Some(&Value::Null));

        assert_eq!(conn.write_batch("copy", batch).await.unwrap(), 2);
        let written = std::fs::read_to_string(dir.path().join("copy.jsonl")).unwrap();
        assert_eq!(written.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_line_is_permanent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.jsonl"), "{\"id\": 1}\nnot json\n").unwrap();

        let mut conn = JsonlAdapter.open(&config(&dir)).await.unwrap();
        let request = ExtractRequest::new("bad", 10);
        let results: Vec<_> = conn.extract(&request).await.unwrap().collect().await;
        assert_eq!(results.len(), 1);
        assert!(!results[0].as_ref().unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_manifest_sets_expected_rows() {
        let dir = TempDir::new().unwrap();
        let lines: Vec<String> = (1..=3).map(|i| json!({ "id": i }).to_string()).collect();
        std::fs::write(dir.path().join("orders.jsonl"), lines.join("\n")).unwrap();
        std::fs::write(dir.path().join("orders.manifest.json"), r#"{"rows": 4}"#).unwrap();

        let mut conn = JsonlAdapter.open(&config(&dir)).await.unwrap();
        let batches: Vec<RecordBatch> = conn
            .extract(&ExtractRequest::new("orders", 2))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let shape: Vec<(usize, Option<usize>)> = batches.iter().map(|b| (b.num_rows(), b.expected_rows)).collect();
        assert_eq!(shape, vec![(2, Some(2)), (1, Some(2)), (0, Some(1))]);
    }

    #[tokio::test]
    async fn test_watermark_skips_old_lines() {
        let dir = TempDir::new().unwrap();
        let lines = [
            json!({ "id": 1, "updated_at": "2026-10-18T10:00:00Z" }),
            json!({ "id": 2, "updated_at": "2026-10-19T10:00:00Z" }),
            json!({ "id": 3, "updated_at": null }),
            json!({ "id": 4, "updated_at": "2026-10-19T11:00:00Z" }),
        ]
        .map(|l| l.to_string());
        std::fs::write(dir.path().join("events.jsonl"), lines.join("\n")).unwrap();

        let mark = Watermark::new("updated_at", Value::from("2026-10-19T00:00:00Z"));
        let request = ExtractRequest::new("events", 1).with_watermark(Some(mark));
        let mut conn = JsonlAdapter.open(&config(&dir)).await.unwrap();
        let batches: Vec<RecordBatch> = conn.extract(&request).await.unwrap().try_collect().await.unwrap();

        let ids: Vec<&Value> = batches.iter().filter_map(|b| b.value(0, "id")).collect();
        assert_eq!(ids, vec![&Value::Int(2), &Value::Int(4)]);
    }

    #[tokio::test]
    async fn test_missing_dir_option() {
        let err = JsonlAdapter.open(&ConnectionConfig::new("jsonl")).await.err().unwrap();
        assert!(!err.is_transient());
    }
}
