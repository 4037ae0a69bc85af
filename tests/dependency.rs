//! Dependency Integration Tests
//!
//! Tests for graph construction, per-window readiness and skip propagation.

use sluice::core::{DependencyError, DependencyGraph, DependencyManager, Readiness};
use sluice::domain::{JobDefinition, RunState, RunWindow, SourceRef, TargetRef};

fn job(id: &str, deps: &[&str]) -> JobDefinition {
    JobDefinition::new(id, "@daily", SourceRef::new("src", id), TargetRef::new("dst", id))
        .with_dependencies(deps.iter().copied())
}

fn chain() -> Vec<JobDefinition> {
    vec![job("c", &["b"]), job("b", &["a"]), job("a", &[])]
}

#[test]
fn test_chain_becomes_eligible_in_order() {
    let manager = DependencyManager::new(DependencyGraph::build(&chain()).unwrap());
    let window = RunWindow::new("2026-10-19");

    assert_eq!(manager.graph().order(), ["a", "b", "c"]);
    assert_eq!(manager.readiness("a", &window), Readiness::Ready(vec![]));
    assert_eq!(manager.readiness("b", &window), Readiness::Waiting);
    assert_eq!(manager.readiness("c", &window), Readiness::Waiting);

    manager.record_outcome("a", &window, RunState::Succeeded);
    assert!(matches!(manager.readiness("b", &window), Readiness::Ready(_)));
    assert_eq!(manager.readiness("c", &window), Readiness::Waiting);

    manager.record_outcome("b", &window, RunState::Succeeded);
    assert!(manager.eligible(&window).contains("c"));

    // A fresh window starts from nothing
    let next = RunWindow::new("2026-10-20");
    assert_eq!(manager.readiness("b", &next), Readiness::Waiting);
}

#[test]
fn test_failure_skips_transitive_dependents() {
    let jobs = vec![
        job("extract", &[]),
        job("clean", &["extract"]),
        job("report", &["clean"]),
        job("audit", &[]),
    ];
    let manager = DependencyManager::new(DependencyGraph::build(&jobs).unwrap());
    let window = RunWindow::new("w");

    let skipped = manager.record_outcome("extract", &window, RunState::Failed);
    assert_eq!(skipped, vec!["clean".to_string(), "report".to_string()]);

    assert_eq!(manager.outcome("report", &window).unwrap().state, RunState::Skipped);
    assert!(manager.outcome("audit", &window).is_none());
    assert_eq!(manager.readiness("clean", &window), Readiness::Blocked);

    // Outcomes are final for the window
    assert!(manager.record_outcome("clean", &window, RunState::Succeeded).is_empty());
    assert_eq!(manager.outcome("clean", &window).unwrap().state, RunState::Skipped);
}

#[test]
fn test_cycle_is_rejected() {
    let jobs = vec![job("a", &["c"]), job("b", &["a"]), job("c", &["b"]), job("d", &[])];

    match DependencyGraph::build(&jobs) {
        Err(DependencyError::Cycle { jobs }) => {
            assert_eq!(jobs.len(), 3);
            assert!(!jobs.contains(&"d".to_string()));
        }
        other => panic!("expected cycle error, got {:?}", other),
    }
}

#[test]
fn test_unknown_prerequisite_is_rejected() {
    let err = DependencyGraph::build(&[job("a", &["ghost"])]).unwrap_err();
    assert_eq!(
        err,
        DependencyError::UnknownPrerequisite {
            job: "a".to_string(),
            prerequisite: "ghost".to_string(),
        }
    );
}

#[test]
fn test_failed_reload_keeps_current_graph() {
    let manager = DependencyManager::new(DependencyGraph::build(&chain()).unwrap());

    let cyclic = vec![job("a", &["b"]), job("b", &["a"])];
    assert!(manager.reload(&cyclic).is_err());
    assert_eq!(manager.graph().len(), 3);

    let graph = manager.reload(&[job("solo", &[])]).unwrap();
    assert_eq!(graph.order(), ["solo"]);
    assert_eq!(manager.graph().len(), 1);
}

#[test]
fn test_forget_before_drops_old_windows() {
    let manager = DependencyManager::new(DependencyGraph::build(&chain()).unwrap());
    let old = RunWindow::new("2026-10-18");
    let current = RunWindow::new("2026-10-19");

    manager.record_outcome("a", &old, RunState::Succeeded);
    manager.record_outcome("a", &current, RunState::Succeeded);
    manager.forget_before(&current);

    assert!(manager.outcome("a", &old).is_none());
    assert!(manager.outcome("a", &current).is_some());
}
