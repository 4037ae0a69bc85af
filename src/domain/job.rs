//! Job definitions and the rulesets they reference.
//!
//! Jobs are loaded from YAML and never mutated after load; a configuration
//! reload replaces the whole set.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::batch::Schema;
use super::error::ErrorKind;
use super::validation::Rule;

/// A configured, schedulable unit of extract/transform/load work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique job id
    pub id: String,

    #[serde(default)]
    pub description: String,

    /// Schedule expression (cron, `@daily`, `@every 5m`, `@manual`)
    pub schedule: String,

    /// Jobs that must succeed in the same run window first
    #[serde(default)]
    pub depends_on: Vec<String>,

    pub source: SourceRef,

    /// Name of the ruleset holding validation rules and transform steps
    #[serde(default)]
    pub transform_ruleset: Option<String>,

    pub target: TargetRef,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Rows per extracted batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_batch_size() -> usize {
    1000
}

impl JobDefinition {
    /// Build a job with default retry policy and batch size
    pub fn new(id: impl Into<String>, schedule: impl Into<String>, source: SourceRef, target: TargetRef) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            schedule: schedule.into(),
            depends_on: Vec::new(),
            source,
            transform_ruleset: None,
            target,
            retry: RetryPolicy::default(),
            enabled: true,
            batch_size: default_batch_size(),
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ruleset(mut self, ruleset: impl Into<String>) -> Self {
        self.transform_ruleset = Some(ruleset.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Where a job reads from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Connection name from the `connections` section
    pub connection: String,

    /// Adapter-specific query (table, file stem, SQL text)
    pub query: String,

    /// Declared schema; adapters infer one when absent
    #[serde(default)]
    pub schema: Option<Schema>,

    /// Column whose high-water mark bounds the next extract.
    ///
    /// When set, each run reads only rows whose value in this column is
    /// greater than the mark recorded by the job's last successful run.
    #[serde(default, alias = "incremental")]
    pub incremental_column: Option<String>,
}

impl SourceRef {
    pub fn new(connection: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            query: query.into(),
            schema: None,
            incremental_column: None,
        }
    }

    pub fn incremental_on(mut self, column: impl Into<String>) -> Self {
        self.incremental_column = Some(column.into());
        self
    }
}

/// Where a job writes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub connection: String,
    pub table: String,
}

impl TargetRef {
    pub fn new(connection: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            table: table.into(),
        }
    }
}

/// Retry policy for failed runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt in milliseconds
    #[serde(default = "default_base_delay", alias = "base_delay")]
    pub base_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_factor", alias = "backoff_multiplier")]
    pub backoff_factor: f64,

    /// Optional ceiling on the computed delay in milliseconds
    #[serde(default)]
    pub max_delay_ms: Option<u64>,

    /// Random perturbation of the delay, as a fraction in [0, 1)
    #[serde(default)]
    pub jitter_fraction: f64,

    /// Error kinds worth another attempt
    #[serde(default = "default_retryable")]
    pub retryable: BTreeSet<ErrorKind>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_retryable() -> BTreeSet<ErrorKind> {
    [ErrorKind::Connection, ErrorKind::Extract, ErrorKind::Load]
        .into_iter()
        .collect()
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: None,
            jitter_fraction: 0.0,
            retryable: default_retryable(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Un-jittered delay after the given failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay_ms = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);

        if let Some(max) = self.max_delay_ms {
            delay_ms = delay_ms.min(max as f64);
        }

        Duration::from_millis(delay_ms.max(0.0).round() as u64)
    }

    /// Check whether another attempt is allowed after `attempt`
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Check whether failures of this kind are retried
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        if kind == ErrorKind::Cancelled {
            return false;
        }
        self.retryable.contains(&kind) || self.retryable.contains(&kind.retry_class())
    }

    /// Describe what is wrong with this policy, if anything
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts < 1 {
            problems.push("max_attempts must be at least 1".to_string());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            problems.push(format!("backoff_factor must be >= 1.0, got {}", self.backoff_factor));
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            problems.push(format!(
                "jitter_fraction must be in [0, 1), got {}",
                self.jitter_fraction
            ));
        }
        problems
    }
}

/// Validation rules and transform steps applied by a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ruleset {
    #[serde(default)]
    pub validation: StageRules,

    /// Transform steps, applied in declared order
    #[serde(default)]
    pub steps: Vec<StepConfig>,
}

/// Rules checked at each validation gate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageRules {
    /// Checked on each batch as extracted
    #[serde(default)]
    pub post_extract: Vec<Rule>,

    /// Checked on each batch after the transform chain, before load
    #[serde(default)]
    pub post_transform: Vec<Rule>,
}

/// One configured transform step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,

    /// Registered transform kind (e.g. `drop_nulls`, `cast`)
    pub kind: String,

    #[serde(default)]
    pub params: serde_json::Value,

    /// Drop the offending rows instead of failing the run
    #[serde(default)]
    pub skip_on_error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const JOB_YAML: &str = r#"
id: daily_customers
schedule: "0 2 * * *"
depends_on: [raw_customers]
source:
  connection: crm
  query: customers
target:
  connection: warehouse
  table: dim_customers
transform_ruleset: customers
retry:
  max_attempts: 4
  base_delay: 500
  backoff_factor: 3.0
  jitter_fraction: 0.1
"#;

    #[test]
    fn test_job_parsing() {
        let job: JobDefinition = serde_yaml::from_str(JOB_YAML).unwrap();

        assert_eq!(job.id, "daily_customers");
        assert_eq!(job.depends_on, vec!["raw_customers".to_string()]);
        assert_eq!(job.transform_ruleset.as_deref(), Some("customers"));
        assert_eq!(job.retry.max_attempts, 4);
        assert_eq!(job.retry.base_delay_ms, 500);
        assert!(job.enabled);
        assert_eq!(job.batch_size, 1000);
        assert!(job.retry.retryable.contains(&ErrorKind::Connection));
        assert!(job.source.incremental_column.is_none());
    }

    #[test]
    fn test_incremental_source() {
        let source: SourceRef = serde_yaml::from_str(
            r#"
connection: crm
query: orders
incremental: updated_at
"#,
        )
        .unwrap();
        assert_eq!(source, SourceRef::new("crm", "orders").incremental_on("updated_at"));
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: Some(10000),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(10000)); // Capped
    }

    #[test]
    fn test_pool_exhaustion_follows_connection_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(ErrorKind::PoolExhausted));
        assert!(!policy.is_retryable(ErrorKind::Validation));
        assert!(!policy.is_retryable(ErrorKind::Cancelled));
    }

    #[test]
    fn test_policy_problems() {
        let policy = RetryPolicy {
            max_attempts: 0,
            backoff_factor: 0.5,
            jitter_fraction: 1.0,
            ..Default::default()
        };
        assert_eq!(policy.problems().len(), 3);
        assert!(RetryPolicy::default().problems().is_empty());
    }

    #[test]
    fn test_ruleset_parsing() {
        let yaml = r#"
validation:
  post_extract:
    - name: id_present
      check: not_null
      columns: [id]
steps:
  - name: cast_age
    kind: cast
    params:
      columns: { age: int }
    skip_on_error: true
"#;
        let ruleset: Ruleset = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ruleset.validation.post_extract.len(), 1);
        assert!(ruleset.validation.post_transform.is_empty());
        assert_eq!(ruleset.steps[0].kind, "cast");
        assert!(ruleset.steps[0].skip_on_error);
    }
}
