//! Job dependency graph and per-window eligibility.
//!
//! The graph is an immutable snapshot; reloading configuration builds a new
//! one and swaps it in atomically. Outcomes are recorded per run window and
//! are final once recorded.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{JobDefinition, PipelineRun, RunState, RunWindow};

/// Errors from building a dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("dependency cycle detected among jobs: {}", .jobs.join(", "))]
    Cycle { jobs: Vec<String> },

    #[error("job '{job}' depends on unknown job '{prerequisite}'")]
    UnknownPrerequisite { job: String, prerequisite: String },

    #[error("job id '{0}' is defined more than once")]
    DuplicateJob(String),
}

/// Immutable, acyclic job dependency graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// Job ids in topological order (prerequisites first)
    order: Vec<String>,

    /// job -> direct prerequisites
    prerequisites: HashMap<String, Vec<String>>,

    /// job -> direct dependents
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build and check a graph from job definitions.
    ///
    /// Fails on duplicate ids, unknown prerequisites and cycles; nothing is
    /// dropped silently.
    pub fn build(jobs: &[JobDefinition]) -> Result<Self, DependencyError> {
        let mut prerequisites: HashMap<String, Vec<String>> = HashMap::new();
        for job in jobs {
            if prerequisites.contains_key(&job.id) {
                return Err(DependencyError::DuplicateJob(job.id.clone()));
            }
            let mut deps: Vec<String> = Vec::new();
            for dep in &job.depends_on {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            prerequisites.insert(job.id.clone(), deps);
        }

        let mut dependents: HashMap<String, Vec<String>> =
            prerequisites.keys().map(|id| (id.clone(), Vec::new())).collect();
        for job in jobs {
            for dep in &prerequisites[&job.id] {
                match dependents.get_mut(dep) {
                    Some(list) => list.push(job.id.clone()),
                    None => {
                        return Err(DependencyError::UnknownPrerequisite {
                            job: job.id.clone(),
                            prerequisite: dep.clone(),
                        })
                    }
                }
            }
        }

        // Kahn's algorithm; ties broken by declaration order for stable output
        let mut in_degree: HashMap<&str, usize> = prerequisites
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();
        let mut queue: VecDeque<&str> = jobs
            .iter()
            .map(|j| j.id.as_str())
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(jobs.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for dependent in &dependents[id] {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }

        if order.len() != jobs.len() {
            let placed: HashSet<&String> = order.iter().collect();
            let mut stuck: Vec<String> = jobs
                .iter()
                .map(|j| j.id.clone())
                .filter(|id| !placed.contains(id))
                .collect();
            stuck.sort();
            return Err(DependencyError::Cycle { jobs: stuck });
        }

        Ok(Self {
            order,
            prerequisites,
            dependents,
        })
    }

    /// Job ids in topological order
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.prerequisites.contains_key(job_id)
    }

    pub fn prerequisites(&self, job_id: &str) -> &[String] {
        self.prerequisites.get(job_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, job_id: &str) -> &[String] {
        self.dependents.get(job_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Final outcome of a job in one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub state: RunState,

    /// Run that produced the outcome; absent for propagated skips
    pub run_id: Option<Uuid>,
}

/// Where a job's prerequisites stand in a window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// All prerequisites succeeded; carries their run ids
    Ready(Vec<Uuid>),

    /// Some prerequisite has no outcome yet
    Waiting,

    /// Some prerequisite failed or was skipped
    Blocked,
}

/// Maintains the dependency graph and computes run eligibility
pub struct DependencyManager {
    graph: ArcSwap<DependencyGraph>,
    outcomes: Mutex<BTreeMap<RunWindow, HashMap<String, Outcome>>>,
}

impl Default for DependencyManager {
    fn default() -> Self {
        Self::new(DependencyGraph::default())
    }
}

impl DependencyManager {
    pub fn new(graph: DependencyGraph) -> Self {
        Self {
            graph: ArcSwap::from_pointee(graph),
            outcomes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Build a graph without installing it
    pub fn build_graph(jobs: &[JobDefinition]) -> Result<DependencyGraph, DependencyError> {
        DependencyGraph::build(jobs)
    }

    /// Swap in a fully built graph
    pub fn install(&self, graph: Arc<DependencyGraph>) {
        info!(jobs = graph.len(), "Installed dependency graph");
        self.graph.store(graph);
    }

    /// Build a graph from `jobs` and install it; on error the current graph stays
    pub fn reload(&self, jobs: &[JobDefinition]) -> Result<Arc<DependencyGraph>, DependencyError> {
        let graph = Arc::new(DependencyGraph::build(jobs)?);
        self.install(Arc::clone(&graph));
        Ok(graph)
    }

    /// Current graph snapshot
    pub fn graph(&self) -> Arc<DependencyGraph> {
        self.graph.load_full()
    }

    fn lock_outcomes(&self) -> MutexGuard<'_, BTreeMap<RunWindow, HashMap<String, Outcome>>> {
        match self.outcomes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Jobs whose prerequisites are empty or all `Succeeded` in `window`
    pub fn eligible(&self, window: &RunWindow) -> BTreeSet<String> {
        let graph = self.graph();
        let outcomes = self.lock_outcomes();
        let recorded = outcomes.get(window);

        graph
            .order()
            .iter()
            .filter(|job| {
                graph.prerequisites(job).iter().all(|dep| {
                    recorded
                        .and_then(|r| r.get(dep))
                        .map_or(false, |o| o.state == RunState::Succeeded)
                })
            })
            .cloned()
            .collect()
    }

    /// Recorded outcome of a job in a window
    pub fn outcome(&self, job_id: &str, window: &RunWindow) -> Option<Outcome> {
        self.lock_outcomes().get(window)?.get(job_id).copied()
    }

    /// Readiness of a job in a window, judged by its direct prerequisites
    pub fn readiness(&self, job_id: &str, window: &RunWindow) -> Readiness {
        let graph = self.graph();
        let outcomes = self.lock_outcomes();
        let recorded = outcomes.get(window);

        let mut triggers = Vec::new();
        let mut waiting = false;
        for dep in graph.prerequisites(job_id) {
            match recorded.and_then(|r| r.get(dep)) {
                Some(o) if o.state == RunState::Succeeded => triggers.extend(o.run_id),
                Some(_) => return Readiness::Blocked,
                None => waiting = true,
            }
        }

        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready(triggers)
        }
    }

    /// Record a job's final outcome for a window.
    ///
    /// Only `Succeeded`, `Failed` and `Skipped` are recorded, and only the
    /// first outcome per job and window counts. A failure or skip propagates
    /// `Skipped` to every undecided transitive dependent; their ids are
    /// returned in topological order.
    pub fn record_outcome(&self, job_id: &str, window: &RunWindow, state: RunState) -> Vec<String> {
        self.record(job_id, window, state, None)
    }

    /// Record the outcome of a terminal run in its own window
    pub fn record_run(&self, run: &PipelineRun) -> Vec<String> {
        self.record(&run.job_id, &run.window, run.state, Some(run.id))
    }

    fn record(&self, job_id: &str, window: &RunWindow, state: RunState, run_id: Option<Uuid>) -> Vec<String> {
        if !matches!(state, RunState::Succeeded | RunState::Failed | RunState::Skipped) {
            debug!(job = %job_id, %state, "Ignoring non-final outcome");
            return Vec::new();
        }

        let graph = self.graph();
        let mut outcomes = self.lock_outcomes();
        let recorded = outcomes.entry(window.clone()).or_default();

        if let Some(existing) = recorded.get(job_id) {
            debug!(job = %job_id, %window, existing = %existing.state, "Outcome already decided");
            return Vec::new();
        }
        recorded.insert(job_id.to_string(), Outcome { state, run_id });

        if state == RunState::Succeeded {
            return Vec::new();
        }

        // One pass in topological order, seeded from the failed job
        let mut blocked: HashSet<&str> = HashSet::from([job_id]);
        let mut skipped = Vec::new();
        for node in graph.order() {
            if blocked.contains(node.as_str()) {
                continue;
            }
            if !graph.prerequisites(node).iter().any(|p| blocked.contains(p.as_str())) {
                continue;
            }
            match recorded.get(node.as_str()) {
                None => {
                    recorded.insert(
                        node.clone(),
                        Outcome {
                            state: RunState::Skipped,
                            run_id: None,
                        },
                    );
                    skipped.push(node.clone());
                    blocked.insert(node.as_str());
                }
                Some(o) if o.state != RunState::Succeeded => {
                    blocked.insert(node.as_str());
                }
                Some(_) => {}
            }
        }

        if !skipped.is_empty() {
            info!(job = %job_id, %window, skipped = ?skipped, "Propagated skip to dependents");
        }
        skipped
    }

    /// Drop outcomes of windows older than `window`
    pub fn forget_before(&self, window: &RunWindow) {
        let mut outcomes = self.lock_outcomes();
        let keep = outcomes.split_off(window);
        *outcomes = keep;
    }
}
