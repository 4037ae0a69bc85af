//! Validation Integration Tests
//!
//! Tests for the validation gates between pipeline stages, with rulesets
//! loaded the way configuration declares them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;

use sluice::adapters::{MemoryAdapter, Registry};
use sluice::core::connection::{ConnectSettings, ConnectionConfig, ConnectionManager};
use sluice::core::validator::StaticLookup;
use sluice::core::PipelineOrchestrator;
use sluice::domain::{
    Column, ColumnType, ErrorKind, JobDefinition, RecordBatch, RunEvent, RunState, Ruleset, Schema, Severity,
    SourceRef, TargetRef, ValidationStage, Value,
};

fn customers() -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Column::new("id", ColumnType::Int),
        Column::new("email", ColumnType::Text),
        Column::new("country", ColumnType::Text),
    ]));
    RecordBatch::new(
        schema,
        vec![
            vec![Value::Int(1), "a@example.com".into(), "DE".into()],
            vec![Value::Int(2), Value::Null, "FR".into()],
            vec![Value::Int(3), "c@example.com".into(), "DE".into()],
        ],
    )
}

fn ruleset(yaml: &str) -> HashMap<String, Ruleset> {
    let ruleset: Ruleset = serde_yaml::from_str(yaml).unwrap();
    HashMap::from([("checks".to_string(), ruleset)])
}

fn orchestrator(
    adapter: &MemoryAdapter,
    rulesets: HashMap<String, Ruleset>,
) -> (PipelineOrchestrator, mpsc::UnboundedReceiver<RunEvent>) {
    let mut registry = Registry::with_builtins();
    registry.register_adapter("memory", Arc::new(adapter.clone()));
    registry.register_resolver("countries", Arc::new(StaticLookup::new(["DE", "FR", "NL"])));
    let registry = Arc::new(registry);

    let config = ConnectionConfig::new("memory").with_connect(ConnectSettings {
        attempts: 1,
        backoff_ms: 1,
    });
    let configs = BTreeMap::from([("crm".to_string(), config.clone()), ("warehouse".to_string(), config)]);
    let connections = Arc::new(ConnectionManager::new(Arc::clone(&registry), configs));

    let (tx, rx) = mpsc::unbounded_channel();
    let orchestrator = PipelineOrchestrator::new(connections, registry, rulesets).with_observer(Arc::new(tx));
    (orchestrator, rx)
}

fn job() -> JobDefinition {
    JobDefinition::new(
        "daily_customers",
        "@daily",
        SourceRef::new("crm", "customers"),
        TargetRef::new("warehouse", "dim_customers"),
    )
    .with_ruleset("checks")
}

fn states(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunState> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        states.push(event.to);
    }
    states
}

#[tokio::test]
async fn test_fail_rule_aborts_before_load() {
    let adapter = MemoryAdapter::new();
    adapter.load_table("customers", vec![customers()]);

    let rules = ruleset(
        r#"
validation:
  post_extract:
    - name: email_present
      check: not_null
      columns: [email]
"#,
    );
    let (orchestrator, mut rx) = orchestrator(&adapter, rules);

    let run = orchestrator.run(&job(), 1).await;

    assert_eq!(run.state, RunState::Failed);
    let error = run.last_error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(run.violations.len(), 1);
    assert_eq!(run.violations[0].row, Some(1));
    assert_eq!(run.rows_written, 0);
    assert!(adapter.written_rows("dim_customers").is_empty());

    let states = states(&mut rx);
    assert!(states.contains(&RunState::Validating(ValidationStage::PostExtract)));
    assert!(!states.contains(&RunState::Transforming));
    assert!(!states.contains(&RunState::Loading));
    assert_eq!(states.last(), Some(&RunState::Failed));
}

#[tokio::test]
async fn test_warn_rule_reaches_loading() {
    let adapter = MemoryAdapter::new();
    adapter.load_table("customers", vec![customers()]);

    let rules = ruleset(
        r#"
validation:
  post_transform:
    - name: email_present
      check: not_null
      columns: [email]
      severity: warn
"#,
    );
    let (orchestrator, mut rx) = orchestrator(&adapter, rules);

    let run = orchestrator.run(&job(), 1).await;

    assert_eq!(run.state, RunState::Succeeded);
    assert_eq!(run.warnings, 1);
    assert_eq!(run.violations.len(), 1);
    assert_eq!(run.violations[0].severity, Severity::Warn);
    assert_eq!(run.rows_written, 3);
    assert!(states(&mut rx).contains(&RunState::Loading));
}

#[tokio::test]
async fn test_lookup_rule_uses_registered_resolver() {
    let adapter = MemoryAdapter::new();
    let mut batch = customers();
    batch.rows[2][2] = "XX".into();
    adapter.load_table("customers", vec![batch]);

    let rules = ruleset(
        r#"
validation:
  post_transform:
    - name: known_country
      check: lookup
      column: country
      resolver: countries
"#,
    );
    let (orchestrator, _rx) = orchestrator(&adapter, rules);

    let run = orchestrator.run(&job(), 1).await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.violations[0].rule, "known_country");
    assert_eq!(run.violations[0].row, Some(2));
    assert!(run.violations[0].message.contains("XX"));
}

#[tokio::test]
async fn test_row_count_against_source_hint() {
    let adapter = MemoryAdapter::new();
    adapter.load_table("customers", vec![customers().with_expected_rows(5)]);

    let rules = ruleset(
        r#"
validation:
  post_extract:
    - name: complete_batch
      check: row_count
      tolerance: 1
"#,
    );
    let (orchestrator, _rx) = orchestrator(&adapter, rules);

    let run = orchestrator.run(&job(), 1).await;

    assert_eq!(run.state, RunState::Failed);
    assert!(run.violations[0].message.contains("expected 5 rows, got 3"));
}

#[tokio::test]
async fn test_row_count_against_adapter_metadata() {
    let rules = r#"
validation:
  post_extract:
    - name: complete_batch
      check: row_count
"#;

    // Stored counts are the metadata: every batch arrives complete
    let adapter = MemoryAdapter::new();
    adapter.load_table("customers", vec![customers(), customers()]);
    let (orchestrator, _rx) = orchestrator(&adapter, ruleset(rules));
    let run = orchestrator.run(&job(), 1).await;
    assert_eq!(run.state, RunState::Succeeded, "{:?}", run.last_error);
    assert!(run.violations.is_empty());

    // The source promises more rows than it delivers
    let adapter = MemoryAdapter::new();
    adapter.load_table("customers", vec![customers(), customers()]);
    adapter.declare_row_count("customers", 8);
    let (orchestrator, _rx) = crate::orchestrator(&adapter, ruleset(rules));
    let run = orchestrator.run(&job(), 1).await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.last_error.unwrap().kind, ErrorKind::Validation);
    assert!(run.violations[0].message.contains("expected 5 rows, got 3"));
    assert_eq!(adapter.written_rows("dim_customers").len(), 3);
}

#[tokio::test]
async fn test_types_rule_rejects_null_in_required_column() {
    let adapter = MemoryAdapter::new();
    let schema = Arc::new(Schema::new(vec![
        Column::new("id", ColumnType::Int).not_null(),
        Column::new("email", ColumnType::Text).not_null(),
        Column::new("country", ColumnType::Text),
    ]));
    adapter.load_table("customers", vec![RecordBatch::new(schema, customers().rows)]);

    let rules = ruleset(
        r#"
validation:
  post_extract:
    - name: typed
      check: types
"#,
    );
    let (orchestrator, _rx) = orchestrator(&adapter, rules);
    let run = orchestrator.run(&job(), 1).await;

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(run.violations.len(), 1);
    assert_eq!(run.violations[0].row, Some(1));
    assert!(run.violations[0].message.contains("'email' is not nullable"));
}
