//! Tabular records flowing between pipeline stages.
//!
//! A `RecordBatch` is a bounded chunk of rows sharing one `Schema`. Batches
//! are produced lazily by extract adapters and handed stage to stage; nothing
//! in the engine retains them past the stage that consumed them.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single cell value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check whether this value may be stored in a column of the given type.
    ///
    /// Nulls always conform; whether a column admits them is checked
    /// against `Column::nullable`. Integers are accepted by float columns.
    pub fn conforms_to(&self, ty: ColumnType) -> bool {
        match (self, ty) {
            (Value::Null, _) => true,
            (Value::Bool(_), ColumnType::Bool) => true,
            (Value::Int(_), ColumnType::Int | ColumnType::Float) => true,
            (Value::Float(_), ColumnType::Float) => true,
            (Value::Timestamp(_), ColumnType::Timestamp) => true,
            (Value::Text(_), ColumnType::Text) => true,
            _ => false,
        }
    }

    /// Order two values of compatible types.
    ///
    /// Ints and floats compare numerically; text is read as RFC 3339 when
    /// compared with a timestamp. Nulls and mismatched types do not compare.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Text(b)) => parse_timestamp(b).map(|b| a.cmp(&b)),
            (Value::Text(a), Value::Timestamp(b)) => parse_timestamp(a).map(|a| a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Name of the runtime type, used in violation messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Timestamp(_) => "timestamp",
            Value::Text(_) => "text",
        }
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|ts| ts.with_timezone(&Utc))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Declared column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Bool => "bool",
            ColumnType::Int => "int",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,

    #[serde(rename = "type")]
    pub ty: ColumnType,

    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Ordered mapping from column name to declared type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// A bounded chunk of rows sharing one schema
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub schema: Arc<Schema>,

    /// Row-major values, one `Vec` per row in schema column order
    pub rows: Vec<Vec<Value>>,

    /// Annotations attached to rows by warn-level validation (row index -> rule names)
    pub tags: BTreeMap<usize, Vec<String>>,

    /// Row count the source promised for this batch, when it knows one
    pub expected_rows: Option<usize>,
}

impl RecordBatch {
    pub fn new(schema: Arc<Schema>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            schema,
            rows,
            tags: BTreeMap::new(),
            expected_rows: None,
        }
    }

    pub fn empty(schema: Arc<Schema>) -> Self {
        Self::new(schema, Vec::new())
    }

    pub fn with_expected_rows(mut self, expected: usize) -> Self {
        self.expected_rows = Some(expected);
        self
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value at (row, column name), if both exist
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.schema.index_of(column)?;
        self.rows.get(row)?.get(idx)
    }

    /// Attach an annotation to a row
    pub fn tag_row(&mut self, row: usize, tag: impl Into<String>) {
        let tag = tag.into();
        let entry = self.tags.entry(row).or_default();
        if !entry.contains(&tag) {
            entry.push(tag);
        }
    }

    /// Remove the given rows, keeping order and remapping row tags.
    ///
    /// Out-of-range and duplicate indices are ignored. Returns the number of
    /// rows actually removed.
    pub fn drop_rows(&mut self, indices: &[usize]) -> usize {
        if indices.is_empty() {
            return 0;
        }

        let mut remove = vec![false; self.rows.len()];
        for &idx in indices {
            if let Some(slot) = remove.get_mut(idx) {
                *slot = true;
            }
        }

        let mut kept_rows = Vec::with_capacity(self.rows.len());
        let mut kept_tags = BTreeMap::new();
        let mut removed = 0;

        for (old_idx, row) in std::mem::take(&mut self.rows).into_iter().enumerate() {
            if remove[old_idx] {
                removed += 1;
                continue;
            }
            if let Some(tags) = self.tags.remove(&old_idx) {
                kept_tags.insert(kept_rows.len(), tags);
            }
            kept_rows.push(row);
        }

        self.rows = kept_rows;
        self.tags = kept_tags;
        self.expected_rows = None;
        removed
    }
}
