//! Data quality rules and their results.

use serde::{Deserialize, Serialize};

/// What happens when a rule is violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Abort the run at this stage
    #[default]
    Fail,

    /// Record the violation, tag the rows and continue
    Warn,
}

/// A named, severity-carrying data quality rule
///
/// ```yaml
/// - name: email_present
///   check: not_null
///   columns: [email]
///   severity: warn
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,

    #[serde(default)]
    pub severity: Severity,

    #[serde(flatten)]
    pub check: Check,
}

impl Rule {
    pub fn new(name: impl Into<String>, severity: Severity, check: Check) -> Self {
        Self {
            name: name.into(),
            severity,
            check,
        }
    }
}

/// The condition a rule tests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Check {
    /// Columns must exist in the batch schema
    RequiredColumns { columns: Vec<String> },

    /// Columns must not hold nulls
    NotNull { columns: Vec<String> },

    /// Every value must conform to its declared column type
    Types,

    /// Non-null values in `column` must be known to the named resolver
    Lookup { column: String, resolver: String },

    /// Batch row count must match the expected count.
    ///
    /// `expected` overrides the count the source attached to the batch;
    /// without either, the rule passes.
    RowCount {
        #[serde(default)]
        expected: Option<usize>,

        #[serde(default)]
        tolerance: usize,
    },
}

/// One rule violation; `row` is absent for batch-level rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub row: Option<usize>,
    pub rule: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// False when any fail-severity rule was violated
    pub passed: bool,

    /// Violations in rule order, then row order
    pub violations: Vec<Violation>,
}

impl ValidationResult {
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        let passed = !violations.iter().any(|v| v.severity == Severity::Fail);
        Self { passed, violations }
    }

    pub fn failures(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Fail)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.severity == Severity::Warn)
    }
}
