//! Built-in transform steps.
//!
//! | kind         | params                                   |
//! |--------------|------------------------------------------|
//! | `drop_nulls` | `columns: [a, b]` (empty = every column) |
//! | `rename`     | `columns: {old: new}`                    |
//! | `cast`       | `columns: {name: int\|float\|text\|bool\|timestamp}` |
//! | `filter`     | `column`, `equals`, optional `negate`    |

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{StepError, StepOutput, TransformStep};
use crate::domain::{Column, ColumnType, RecordBatch, Schema, Value};

/// All built-in steps
pub fn builtin() -> Vec<Arc<dyn TransformStep>> {
    vec![Arc::new(DropNulls), Arc::new(Rename), Arc::new(Cast), Arc::new(Filter)]
}

fn parse_params<T: DeserializeOwned>(kind: &str, params: &serde_json::Value) -> Result<T, StepError> {
    let params = if params.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        params.clone()
    };
    serde_json::from_value(params).map_err(|e| StepError::new(format!("invalid {} params: {}", kind, e)))
}

fn column_index(batch: &RecordBatch, name: &str) -> Result<usize, StepError> {
    batch
        .schema
        .index_of(name)
        .ok_or_else(|| StepError::new(format!("unknown column '{}'", name)))
}

/// Same rows and tags under a new schema
fn with_schema(batch: &RecordBatch, schema: Schema, rows: Vec<Vec<Value>>) -> RecordBatch {
    RecordBatch {
        schema: Arc::new(schema),
        rows,
        tags: batch.tags.clone(),
        expected_rows: batch.expected_rows,
    }
}

/// Remove the given rows from a copy of `batch`
fn without_rows(batch: &RecordBatch, dropped: Vec<usize>) -> StepOutput {
    let mut out = batch.clone();
    out.drop_rows(&dropped);
    StepOutput { batch: out, dropped }
}

#[derive(Deserialize)]
struct DropNullsParams {
    #[serde(default)]
    columns: Vec<String>,
}

/// Drops rows holding a null in any of the listed columns
pub struct DropNulls;

impl TransformStep for DropNulls {
    fn kind(&self) -> &str {
        "drop_nulls"
    }

    fn apply(&self, batch: &RecordBatch, params: &serde_json::Value) -> Result<StepOutput, StepError> {
        let params: DropNullsParams = parse_params(self.kind(), params)?;
        let indices: Vec<usize> = if params.columns.is_empty() {
            (0..batch.schema.len()).collect()
        } else {
            params
                .columns
                .iter()
                .map(|c| column_index(batch, c))
                .collect::<Result<_, _>>()?
        };

        let dropped: Vec<usize> = batch
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| indices.iter().any(|&i| row.get(i).map_or(true, Value::is_null)))
            .map(|(idx, _)| idx)
            .collect();

        Ok(without_rows(batch, dropped))
    }

    fn check_params(&self, params: &serde_json::Value) -> Result<(), String> {
        parse_params::<DropNullsParams>(self.kind(), params)
            .map(|_| ())
            .map_err(|e| e.message)
    }
}

#[derive(Deserialize)]
struct RenameParams {
    columns: BTreeMap<String, String>,
}

/// Renames columns
pub struct Rename;

impl TransformStep for Rename {
    fn kind(&self) -> &str {
        "rename"
    }

    fn apply(&self, batch: &RecordBatch, params: &serde_json::Value) -> Result<StepOutput, StepError> {
        let params: RenameParams = parse_params(self.kind(), params)?;
        for old in params.columns.keys() {
            column_index(batch, old)?;
        }

        let columns: Vec<Column> = batch
            .schema
            .columns
            .iter()
            .map(|column| match params.columns.get(&column.name) {
                Some(new_name) => Column {
                    name: new_name.clone(),
                    ..column.clone()
                },
                None => column.clone(),
            })
            .collect();

        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(StepError::new(format!("rename produces duplicate column '{}'", column.name)));
            }
        }

        Ok(StepOutput::unchanged(with_schema(
            batch,
            Schema::new(columns),
            batch.rows.clone(),
        )))
    }

    fn check_params(&self, params: &serde_json::Value) -> Result<(), String> {
        parse_params::<RenameParams>(self.kind(), params)
            .map(|_| ())
            .map_err(|e| e.message)
    }
}

#[derive(Deserialize)]
struct CastParams {
    columns: BTreeMap<String, ColumnType>,
}

/// Converts column values to new types; rows that cannot convert are reported
pub struct Cast;

impl TransformStep for Cast {
    fn kind(&self) -> &str {
        "cast"
    }

    fn apply(&self, batch: &RecordBatch, params: &serde_json::Value) -> Result<StepOutput, StepError> {
        let params: CastParams = parse_params(self.kind(), params)?;
        let targets: Vec<(usize, ColumnType)> = params
            .columns
            .iter()
            .map(|(name, ty)| column_index(batch, name).map(|idx| (idx, *ty)))
            .collect::<Result<_, _>>()?;

        let mut rows = Vec::with_capacity(batch.num_rows());
        let mut failed = Vec::new();
        let mut first_failure = None;

        for (row_idx, row) in batch.rows.iter().enumerate() {
            let mut converted = row.clone();
            let mut ok = true;
            for &(col, ty) in &targets {
                let Some(value) = row.get(col) else { continue };
                match cast_value(value, ty) {
                    Some(v) => converted[col] = v,
                    None => {
                        ok = false;
                        if first_failure.is_none() {
                            first_failure = Some(format!(
                                "cannot cast '{}' in column '{}' to {}",
                                value, batch.schema.columns[col].name, ty
                            ));
                        }
                    }
                }
            }
            if ok {
                rows.push(converted);
            } else {
                failed.push(row_idx);
            }
        }

        if let Some(message) = first_failure {
            let message = format!("{} ({} row(s) affected)", message, failed.len());
            return Err(StepError::at_rows(message, failed));
        }

        let mut columns = batch.schema.columns.clone();
        for &(col, ty) in &targets {
            columns[col].ty = ty;
        }
        Ok(StepOutput::unchanged(with_schema(batch, Schema::new(columns), rows)))
    }

    fn check_params(&self, params: &serde_json::Value) -> Result<(), String> {
        parse_params::<CastParams>(self.kind(), params)
            .map(|_| ())
            .map_err(|e| e.message)
    }
}

fn cast_value(value: &Value, ty: ColumnType) -> Option<Value> {
    match (value, ty) {
        (Value::Null, _) => Some(Value::Null),

        (Value::Int(i), ColumnType::Int) => Some(Value::Int(*i)),
        (Value::Float(f), ColumnType::Int) if f.fract() == 0.0 && f.is_finite() => Some(Value::Int(*f as i64)),
        (Value::Bool(b), ColumnType::Int) => Some(Value::Int(*b as i64)),
        (Value::Text(s), ColumnType::Int) => s.trim().parse().ok().map(Value::Int),

        (Value::Int(i), ColumnType::Float) => Some(Value::Float(*i as f64)),
        (Value::Float(f), ColumnType::Float) => Some(Value::Float(*f)),
        (Value::Text(s), ColumnType::Float) => s.trim().parse().ok().map(Value::Float),

        (Value::Bool(b), ColumnType::Bool) => Some(Value::Bool(*b)),
        (Value::Int(0), ColumnType::Bool) => Some(Value::Bool(false)),
        (Value::Int(1), ColumnType::Bool) => Some(Value::Bool(true)),
        (Value::Text(s), ColumnType::Bool) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },

        (Value::Timestamp(ts), ColumnType::Timestamp) => Some(Value::Timestamp(*ts)),
        (Value::Int(secs), ColumnType::Timestamp) => Utc.timestamp_opt(*secs, 0).single().map(Value::Timestamp),
        (Value::Text(s), ColumnType::Timestamp) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|ts| Value::Timestamp(ts.with_timezone(&Utc))),

        (other, ColumnType::Text) => Some(Value::Text(other.to_string())),

        _ => None,
    }
}

#[derive(Deserialize)]
struct FilterParams {
    column: String,
    equals: Value,
    #[serde(default)]
    negate: bool,
}

/// Keeps rows whose column equals a value (compared by text form)
pub struct Filter;

impl TransformStep for Filter {
    fn kind(&self) -> &str {
        "filter"
    }

    fn apply(&self, batch: &RecordBatch, params: &serde_json::Value) -> Result<StepOutput, StepError> {
        let params: FilterParams = parse_params(self.kind(), params)?;
        let col = column_index(batch, &params.column)?;
        let wanted = params.equals.to_string();

        let dropped: Vec<usize> = batch
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                let matches = row.get(col).map_or(false, |v| v.to_string() == wanted);
                matches == params.negate
            })
            .map(|(idx, _)| idx)
            .collect();

        Ok(without_rows(batch, dropped))
    }

    fn check_params(&self, params: &serde_json::Value) -> Result<(), String> {
        parse_params::<FilterParams>(self.kind(), params)
            .map(|_| ())
            .map_err(|e| e.message)
    }
}
