//! Batch validation against data quality rules.
//!
//! Validation never mutates the batch; it only reports violations. The
//! orchestrator decides what a violation means for the run.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::domain::{Check, RecordBatch, Rule, ValidationResult, Value, Violation};

/// Answers referential lookups for `lookup` rules
pub trait LookupResolver: Send + Sync {
    fn contains(&self, value: &Value) -> bool;
}

/// Resolver over a fixed set of values, compared by their text form
#[derive(Debug, Clone, Default)]
pub struct StaticLookup {
    values: BTreeSet<String>,
}

impl StaticLookup {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

impl LookupResolver for StaticLookup {
    fn contains(&self, value: &Value) -> bool {
        self.values.contains(&value.to_string())
    }
}

/// Checks batches against rules
#[derive(Clone, Default)]
pub struct DataValidator {
    resolvers: HashMap<String, Arc<dyn LookupResolver>>,
}

impl DataValidator {
    pub fn new(resolvers: HashMap<String, Arc<dyn LookupResolver>>) -> Self {
        Self { resolvers }
    }

    pub fn has_resolver(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    /// Check a batch against every rule, in order
    pub fn validate(&self, batch: &RecordBatch, rules: &[Rule]) -> ValidationResult {
        let mut violations = Vec::new();
        for rule in rules {
            self.check_rule(batch, rule, &mut violations);
        }
        ValidationResult::from_violations(violations)
    }

    fn check_rule(&self, batch: &RecordBatch, rule: &Rule, out: &mut Vec<Violation>) {
        let violation = |row: Option<usize>, message: String| Violation {
            row,
            rule: rule.name.clone(),
            severity: rule.severity,
            message,
        };

        match &rule.check {
            Check::RequiredColumns { columns } => {
                for column in columns {
                    if batch.schema.index_of(column).is_none() {
                        out.push(violation(None, format!("required column '{}' is missing", column)));
                    }
                }
            }

            Check::NotNull { columns } => {
                for column in columns {
                    let Some(idx) = batch.schema.index_of(column) else {
                        out.push(violation(None, format!("column '{}' is missing", column)));
                        continue;
                    };
                    for (row_idx, row) in batch.rows.iter().enumerate() {
                        if row.get(idx).map_or(true, Value::is_null) {
                            out.push(violation(Some(row_idx), format!("null in column '{}'", column)));
                        }
                    }
                }
            }

            Check::Types => {
                for (row_idx, row) in batch.rows.iter().enumerate() {
                    if row.len() != batch.schema.len() {
                        out.push(violation(
                            Some(row_idx),
                            format!("row has {} values, schema has {} columns", row.len(), batch.schema.len()),
                        ));
                        continue;
                    }
                    for (column, value) in batch.schema.columns.iter().zip(row) {
                        if value.is_null() && !column.nullable {
                            out.push(violation(
                                Some(row_idx),
                                format!("column '{}' is not nullable", column.name),
                            ));
                        } else if !value.conforms_to(column.ty) {
                            out.push(violation(
                                Some(row_idx),
                                format!(
                                    "column '{}' expects {}, found {}",
                                    column.name,
                                    column.ty,
                                    value.type_name()
                                ),
                            ));
                        }
                    }
                }
            }

            Check::Lookup { column, resolver } => {
                let Some(resolver_impl) = self.resolvers.get(resolver) else {
                    out.push(violation(None, format!("lookup resolver '{}' is not registered", resolver)));
                    return;
                };
                let Some(idx) = batch.schema.index_of(column) else {
                    out.push(violation(None, format!("column '{}' is missing", column)));
                    return;
                };
                for (row_idx, row) in batch.rows.iter().enumerate() {
                    match row.get(idx) {
                        Some(value) if !value.is_null() && !resolver_impl.contains(value) => {
                            out.push(violation(
                                Some(row_idx),
                                format!("'{}' in column '{}' not found in '{}'", value, column, resolver),
                            ));
                        }
                        _ => {}
                    }
                }
            }

            Check::RowCount { expected, tolerance } => {
                let Some(expected) = expected.or(batch.expected_rows) else {
                    return;
                };
                let actual = batch.num_rows();
                if actual.abs_diff(expected) > *tolerance {
                    out.push(violation(
                        None,
                        format!("expected {} rows, got {}", expected, actual),
                    ));
                }
            }
        }
    }
}
