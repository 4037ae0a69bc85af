//! Time- and dependency-driven job scheduler.
//!
//! A single control loop wakes on a tick, on worker completion or on a manual
//! trigger. Due jobs wait in a per-window staging area until their
//! prerequisites are decided, then enter a due-time ordered queue that is
//! drained into at most `max_concurrency` worker tasks.
//!
//! A job has at most one attempt chain in flight; fires that arrive while one
//! is running are coalesced into it.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::notify::Notifier;
use crate::domain::{
    ErrorKind, JobDefinition, PipelineRun, RunError, RunState, RunWindow, TerminalEvent, WindowPolicy,
};

use super::dependency::{DependencyError, DependencyGraph, DependencyManager, Readiness};
use super::history::RunHistory;
use super::orchestrator::PipelineOrchestrator;
use super::retry::{RetryDecision, RetryHandler};
use super::schedule::{Schedule, ScheduleError};
use super::tracker::ErrorTracker;

/// Scheduler settings (`settings.scheduler`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often schedules are evaluated
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Upper bound on concurrently executing runs
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How long `stop` waits for in-flight runs before aborting them
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    #[serde(default)]
    pub window: WindowPolicy,
}

fn default_tick_interval() -> u64 {
    1_000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_grace_period() -> u64 {
    30_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            max_concurrency: default_max_concurrency(),
            grace_period_ms: default_grace_period(),
            window: WindowPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.tick_interval_ms == 0 {
            problems.push("scheduler.tick_interval_ms must be positive".to_string());
        }
        if self.max_concurrency == 0 {
            problems.push("scheduler.max_concurrency must be at least 1".to_string());
        }
        problems
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("job '{0}' already has a run in flight")]
    AlreadyRunning(String),

    #[error("job '{job}' has an invalid schedule: {source}")]
    InvalidSchedule {
        job: String,
        #[source]
        source: ScheduleError,
    },

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("scheduler is already running")]
    AlreadyStarted,

    #[error("scheduler has been stopped")]
    Stopped,
}

/// Validated, immutable set of job definitions
#[derive(Debug, Clone, Default)]
pub struct JobSet {
    jobs: BTreeMap<String, Arc<JobDefinition>>,
    schedules: HashMap<String, Schedule>,
    graph: Arc<DependencyGraph>,
}

impl JobSet {
    /// Parse every schedule and build the dependency graph
    pub fn build(jobs: Vec<JobDefinition>) -> Result<Self, SchedulerError> {
        let graph = DependencyGraph::build(&jobs)?;

        let mut schedules = HashMap::with_capacity(jobs.len());
        for job in &jobs {
            let schedule = Schedule::parse(&job.schedule).map_err(|source| SchedulerError::InvalidSchedule {
                job: job.id.clone(),
                source,
            })?;
            schedules.insert(job.id.clone(), schedule);
        }

        let jobs = jobs.into_iter().map(|j| (j.id.clone(), Arc::new(j))).collect();
        Ok(Self {
            jobs,
            schedules,
            graph: Arc::new(graph),
        })
    }

    pub fn get(&self, job_id: &str) -> Option<&Arc<JobDefinition>> {
        self.jobs.get(job_id)
    }

    pub fn schedule(&self, job_id: &str) -> Option<&Schedule> {
        self.schedules.get(job_id)
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    /// Jobs ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &Arc<JobDefinition>> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Point-in-time view of the scheduler
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub jobs: usize,
    pub window: Option<RunWindow>,
    pub queued: usize,
    pub in_flight: Vec<String>,

    /// Due jobs waiting on prerequisites
    pub waiting: Vec<String>,
    pub available_workers: usize,
}

/// A run ready for a worker; ordered by due time, then arrival
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Queued {
    due: DateTime<Utc>,
    seq: u64,
    job_id: String,
    attempt: u32,
    window: RunWindow,
    triggered_by: Vec<Uuid>,
}

#[derive(Debug, Clone)]
struct Waiting {
    due: DateTime<Utc>,
    window: RunWindow,
}

#[derive(Default)]
struct LoopState {
    queue: BinaryHeap<Reverse<Queued>>,
    seq: u64,

    /// Jobs with an attempt chain queued, executing or in retry delay
    in_flight: HashSet<String>,
    waiting: BTreeMap<String, Waiting>,
    last_tick: Option<DateTime<Utc>>,
    window: Option<RunWindow>,
}

impl LoopState {
    fn enqueue(&mut self, due: DateTime<Utc>, job_id: String, attempt: u32, window: RunWindow, triggered_by: Vec<Uuid>) {
        self.seq += 1;
        self.queue.push(Reverse(Queued {
            due,
            seq: self.seq,
            job_id,
            attempt,
            window,
            triggered_by,
        }));
    }
}

struct Shared {
    config: SchedulerConfig,
    jobs: ArcSwap<JobSet>,
    deps: Arc<DependencyManager>,
    orchestrator: Arc<PipelineOrchestrator>,
    retry: RetryHandler,
    history: Arc<dyn RunHistory>,
    notifier: Arc<dyn Notifier>,
    tracker: Arc<ErrorTracker>,
    workers: Arc<Semaphore>,
    state: Mutex<LoopState>,
    wake: Notify,

    /// Stops the control loop and cancels retry delays
    shutdown: CancellationToken,

    /// Cancels executing runs once the grace period is over
    abort_runs: CancellationToken,
    tasks: TaskTracker,
}

/// Decides when jobs run and drives them through the orchestrator
pub struct JobScheduler {
    shared: Arc<Shared>,
    control: Mutex<Option<JoinHandle<()>>>,
}

/// Assembles a `JobScheduler` with optional shared components
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    jobs: JobSet,
    orchestrator: Arc<PipelineOrchestrator>,
    history: Arc<dyn RunHistory>,
    notifier: Arc<dyn Notifier>,
    tracker: Option<Arc<ErrorTracker>>,
    retry: Option<RetryHandler>,
}

impl SchedulerBuilder {
    /// Share an error tracker with other components
    pub fn tracker(mut self, tracker: Arc<ErrorTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Use a seeded jitter source
    pub fn retry_handler(mut self, retry: RetryHandler) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn build(self) -> JobScheduler {
        let deps = DependencyManager::default();
        deps.install(Arc::clone(self.jobs.graph()));

        let workers = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let shared = Shared {
            config: self.config,
            jobs: ArcSwap::from_pointee(self.jobs),
            deps: Arc::new(deps),
            orchestrator: self.orchestrator,
            retry: self.retry.unwrap_or_default(),
            history: self.history,
            notifier: self.notifier,
            tracker: self.tracker.unwrap_or_default(),
            workers,
            state: Mutex::new(LoopState::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            abort_runs: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };

        JobScheduler {
            shared: Arc::new(shared),
            control: Mutex::new(None),
        }
    }
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        jobs: JobSet,
        orchestrator: Arc<PipelineOrchestrator>,
        history: Arc<dyn RunHistory>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::builder(config, jobs, orchestrator, history, notifier).build()
    }

    pub fn builder(
        config: SchedulerConfig,
        jobs: JobSet,
        orchestrator: Arc<PipelineOrchestrator>,
        history: Arc<dyn RunHistory>,
        notifier: Arc<dyn Notifier>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            jobs,
            orchestrator,
            history,
            notifier,
            tracker: None,
            retry: None,
        }
    }

    pub fn dependencies(&self) -> &Arc<DependencyManager> {
        &self.shared.deps
    }

    pub fn tracker(&self) -> &Arc<ErrorTracker> {
        &self.shared.tracker
    }

    pub fn jobs(&self) -> Arc<JobSet> {
        self.shared.jobs.load_full()
    }

    fn lock_control(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.control.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start the control loop.
    ///
    /// Schedules are evaluated from this instant on; fires before start are
    /// not replayed.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        let mut control = self.lock_control();
        if control.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }

        let now = Utc::now();
        {
            let mut state = self.shared.lock_state();
            state.last_tick = Some(now);
            state.window = Some(self.shared.config.window.window_for(now));
        }

        info!(
            jobs = self.shared.jobs.load().len(),
            max_concurrency = self.shared.config.max_concurrency,
            tick_ms = self.shared.config.tick_interval_ms,
            "Scheduler started"
        );
        let shared = Arc::clone(&self.shared);
        *control = Some(tokio::spawn(control_loop(shared)));
        Ok(())
    }

    /// Stop scheduling, let in-flight runs finish within the grace period,
    /// then abort whatever is left. Pending retry delays are cancelled.
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.shutdown.cancel();

        let handle = self.lock_control().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler control loop panicked");
            }
        }

        shared.tasks.close();
        let grace = shared.config.grace_period();
        if tokio::time::timeout(grace, shared.tasks.wait()).await.is_err() {
            warn!(
                grace_ms = shared.config.grace_period_ms,
                "Grace period elapsed, aborting in-flight runs"
            );
            shared.abort_runs.cancel();
            shared.tasks.wait().await;
        }

        {
            let mut state = shared.lock_state();
            let dropped = state.queue.len();
            if dropped > 0 {
                info!(dropped, "Discarding queued runs");
            }
            state.queue.clear();
            state.waiting.clear();
            state.in_flight.clear();
        }

        shared.orchestrator.connections().close_all();
        info!("Scheduler stopped");
    }

    /// Queue a job now, bypassing its schedule and prerequisites.
    ///
    /// The outcome is still recorded for the current window.
    pub fn trigger_now(&self, job_id: &str) -> Result<(), SchedulerError> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        if shared.jobs.load().get(job_id).is_none() {
            return Err(SchedulerError::UnknownJob(job_id.to_string()));
        }

        let now = Utc::now();
        let window = shared.config.window.window_for(now);
        {
            let mut state = shared.lock_state();
            if !state.in_flight.insert(job_id.to_string()) {
                return Err(SchedulerError::AlreadyRunning(job_id.to_string()));
            }
            state.waiting.remove(job_id);
            state.enqueue(now, job_id.to_string(), 1, window.clone(), Vec::new());
        }

        info!(job = %job_id, %window, "Manual trigger queued");
        shared.wake.notify_one();
        Ok(())
    }

    /// Run a job to its final outcome in the caller's task, retries included.
    ///
    /// Prerequisites are not consulted. Returns the last attempt, which is
    /// `Aborted` if the scheduler stopped meanwhile.
    pub async fn run_job(&self, job_id: &str) -> Result<PipelineRun, SchedulerError> {
        let shared = &self.shared;
        let job = shared
            .jobs
            .load()
            .get(job_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;

        if !shared.lock_state().in_flight.insert(job.id.clone()) {
            return Err(SchedulerError::AlreadyRunning(job.id.clone()));
        }

        let window = shared.config.window.window_for(Utc::now());
        let mut run = PipelineRun::new(&job, 1, window);
        let finished = loop {
            let permit = tokio::select! {
                _ = shared.shutdown.cancelled() => None,
                permit = Arc::clone(&shared.workers).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                break abort_pending(run);
            };

            let finished = shared.orchestrator.execute(&job, run, &shared.abort_runs).await;
            drop(permit);
            shared.record_attempt(&finished).await;

            match shared.next_step(&finished) {
                Some(delay) => {
                    if shared.wait_for_retry(&job.id, &finished, delay).await {
                        run = finished.next_attempt(&job);
                    } else {
                        break finished;
                    }
                }
                None => {
                    shared.settle(&finished).await;
                    break finished;
                }
            }
        };

        shared.lock_state().in_flight.remove(&job.id);
        shared.wake.notify_one();
        Ok(finished)
    }

    /// Install a new job set.
    ///
    /// Runs already in flight keep the definition they started with.
    pub fn reload(&self, jobs: Vec<JobDefinition>) -> Result<(), SchedulerError> {
        let set = JobSet::build(jobs)?;
        let count = set.len();

        self.shared.deps.install(Arc::clone(set.graph()));
        self.shared.jobs.store(Arc::new(set));

        info!(jobs = count, "Job definitions reloaded");
        self.shared.wake.notify_one();
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let shared = &self.shared;
        let running = self.lock_control().is_some() && !shared.shutdown.is_cancelled();
        let state = shared.lock_state();

        let mut in_flight: Vec<String> = state.in_flight.iter().cloned().collect();
        in_flight.sort();

        SchedulerStatus {
            running,
            jobs: shared.jobs.load().len(),
            window: state.window.clone(),
            queued: state.queue.len(),
            in_flight,
            waiting: state.waiting.keys().cloned().collect(),
            available_workers: shared.workers.available_permits(),
        }
    }
}

/// A run that never started because the scheduler stopped
fn abort_pending(mut run: PipelineRun) -> PipelineRun {
    run.state = RunState::Aborted;
    run.finished_at = Some(Utc::now());
    run.last_error = Some(RunError::new(ErrorKind::Cancelled, "scheduler stopped before the run started"));
    run
}

async fn control_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = ticker.tick() => shared.tick(Utc::now()).await,
            _ = shared.wake.notified() => {}
        }
        shared.promote_waiting().await;
        shared.dispatch();
    }

    debug!("Scheduler control loop exited");
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stage jobs whose schedule fired since the last tick and close out
    /// windows that have ended
    async fn tick(&self, now: DateTime<Utc>) {
        let jobs = self.jobs.load_full();
        let policy = self.config.window;
        let current = policy.window_for(now);

        let (expired, rolled_from) = {
            let mut state = self.lock_state();
            let prev = state.last_tick.replace(now).unwrap_or(now);

            for job in jobs.iter().filter(|j| j.enabled) {
                let Some(fire) = jobs.schedule(&job.id).and_then(|s| s.due_between(prev, now)) else {
                    continue;
                };
                if state.in_flight.contains(&job.id) || state.waiting.contains_key(&job.id) {
                    info!(job = %job.id, %fire, "Previous run still pending, coalescing fire");
                    continue;
                }
                debug!(job = %job.id, %fire, "Schedule fired");
                state.waiting.insert(
                    job.id.clone(),
                    Waiting {
                        due: fire,
                        window: policy.window_for(fire),
                    },
                );
            }

            let expired: Vec<(String, RunWindow)> = state
                .waiting
                .iter()
                .filter(|(_, w)| w.window < current)
                .map(|(id, w)| (id.clone(), w.window.clone()))
                .collect();
            for (id, _) in &expired {
                state.waiting.remove(id);
            }

            let rolled_from = match &state.window {
                Some(previous) if *previous != current => Some(previous.clone()),
                _ => None,
            };
            state.window = Some(current.clone());
            (expired, rolled_from)
        };

        for (job_id, window) in expired {
            if self.deps.outcome(&job_id, &window).is_some() {
                continue;
            }
            if let Some(job) = jobs.get(&job_id) {
                info!(job = %job_id, %window, "Window closed before prerequisites were met");
                let run = PipelineRun::skipped(job, window, "prerequisites not satisfied before the window closed");
                self.record_attempt(&run).await;
                self.settle(&run).await;
            }
        }

        if let Some(previous) = rolled_from {
            info!(from = %previous, to = %current, "Run window rolled over");
            self.deps.forget_before(&previous);
        }
    }

    /// Move staged jobs whose prerequisites are decided into the queue
    async fn promote_waiting(&self) {
        let staged: Vec<(String, Waiting)> = self
            .lock_state()
            .waiting
            .iter()
            .map(|(id, w)| (id.clone(), w.clone()))
            .collect();
        if staged.is_empty() {
            return;
        }

        let mut blocked = Vec::new();
        for (job_id, waiting) in staged {
            match self.deps.readiness(&job_id, &waiting.window) {
                Readiness::Waiting => {}
                Readiness::Ready(triggered_by) => {
                    let mut state = self.lock_state();
                    if state.waiting.remove(&job_id).is_some() && state.in_flight.insert(job_id.clone()) {
                        debug!(job = %job_id, window = %waiting.window, "Prerequisites met, queueing");
                        state.enqueue(waiting.due, job_id, 1, waiting.window, triggered_by);
                    }
                }
                Readiness::Blocked => {
                    self.lock_state().waiting.remove(&job_id);
                    blocked.push((job_id, waiting.window));
                }
            }
        }

        let jobs = self.jobs.load_full();
        for (job_id, window) in blocked {
            if self.deps.outcome(&job_id, &window).is_some() {
                debug!(job = %job_id, %window, "Outcome already decided, not running");
                continue;
            }
            if let Some(job) = jobs.get(&job_id) {
                let run = PipelineRun::skipped(job, window, "a prerequisite did not succeed");
                self.record_attempt(&run).await;
                self.settle(&run).await;
            }
        }
    }

    /// Hand queued runs to workers while slots are free
    fn dispatch(self: &Arc<Self>) {
        loop {
            let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() else {
                return;
            };
            let Some(Reverse(queued)) = self.lock_state().queue.pop() else {
                return;
            };

            let Some(job) = self.jobs.load().get(&queued.job_id).cloned() else {
                warn!(job = %queued.job_id, "Job no longer defined, dropping queued run");
                self.lock_state().in_flight.remove(&queued.job_id);
                continue;
            };

            let run =
                PipelineRun::new(&job, queued.attempt, queued.window).with_triggers(queued.triggered_by);
            let shared = Arc::clone(self);
            self.tasks.spawn(async move { shared.run_attempt(job, run, permit).await });
        }
    }

    /// Worker body: execute one attempt, then settle it or schedule the next
    async fn run_attempt(self: Arc<Self>, job: Arc<JobDefinition>, run: PipelineRun, permit: OwnedSemaphorePermit) {
        let finished = self.orchestrator.execute(&job, run, &self.abort_runs).await;
        drop(permit);
        self.record_attempt(&finished).await;

        if let Some(delay) = self.next_step(&finished) {
            if self.wait_for_retry(&job.id, &finished, delay).await {
                let mut state = self.lock_state();
                state.enqueue(
                    Utc::now(),
                    job.id.clone(),
                    finished.attempt + 1,
                    finished.window.clone(),
                    finished.triggered_by.clone(),
                );
                drop(state);
                self.wake.notify_one();
                return;
            }
        } else {
            self.settle(&finished).await;
        }

        self.lock_state().in_flight.remove(&job.id);
        self.wake.notify_one();
    }

    /// Retry delay for a failed attempt; `None` when the attempt is final
    fn next_step(&self, run: &PipelineRun) -> Option<Duration> {
        if run.state != RunState::Failed {
            return None;
        }
        let error = run
            .last_error
            .clone()
            .unwrap_or_else(|| RunError::new(ErrorKind::Configuration, "run failed without an error"));

        match self.retry.decide(run, &error) {
            RetryDecision::Retry(delay) => Some(delay),
            RetryDecision::GiveUp => None,
        }
    }

    /// Sleep out a retry delay; false if shutdown interrupted it
    async fn wait_for_retry(&self, job_id: &str, run: &PipelineRun, delay: Duration) -> bool {
        info!(
            job = %job_id,
            attempt = run.attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying after delay"
        );
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                info!(job = %job_id, attempt = run.attempt, "Retry cancelled by shutdown");
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Persist one attempt's snapshot
    async fn record_attempt(&self, run: &PipelineRun) {
        if let Err(e) = self.history.append(run).await {
            warn!(run_id = %run.id, job = %run.job_id, error = %e, "Failed to append run to history");
        }
    }

    /// Act on a final outcome: record it for dependencies, track its error,
    /// notify, and emit skip records for dependents it blocked
    async fn settle(&self, run: &PipelineRun) {
        if !matches!(run.state, RunState::Succeeded | RunState::Failed | RunState::Skipped) {
            return;
        }

        let skipped = self.deps.record_run(run);

        let error_id = match (&run.last_error, run.state) {
            (Some(err), RunState::Failed) => Some(self.tracker.track(&run.job_id, run.id, err)),
            _ => None,
        };
        self.notify(TerminalEvent::from_run(run).with_error_id(error_id)).await;

        if skipped.is_empty() {
            return;
        }

        let jobs = self.jobs.load_full();
        let reason = format!("prerequisite '{}' ended {}", run.job_id, run.state);
        for job_id in skipped {
            let Some(job) = jobs.get(&job_id) else { continue };
            self.lock_state().waiting.remove(&job_id);

            info!(job = %job_id, window = %run.window, blocked_by = %run.job_id, "Skipping dependent job");
            let record = PipelineRun::skipped(job, run.window.clone(), reason.clone());
            self.record_attempt(&record).await;
            self.notify(TerminalEvent::from_run(&record)).await;
        }
    }

    async fn notify(&self, event: TerminalEvent) {
        if let Err(e) = self.notifier.notify(&event).await {
            warn!(run_id = %event.run_id, job = %event.job_id, error = %e, "Notification failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryAdapter;
    use crate::adapters::notify::LogNotifier;
    use crate::adapters::Registry;
    use crate::core::connection::{ConnectSettings, ConnectionConfig, ConnectionManager};
    use crate::core::history::MemoryHistory;
    use crate::domain::{Column, ColumnType, RecordBatch, RetryPolicy, Schema, SourceRef, TargetRef, Value};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn batch(rows: i64) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Column::new("id", ColumnType::Int)]));
        RecordBatch::new(schema, (0..rows).map(|i| vec![Value::Int(i)]).collect())
    }

    fn job(id: &str, table: &str) -> JobDefinition {
        JobDefinition::new(id, "@manual", SourceRef::new("src", table), TargetRef::new("dst", id))
    }

    fn orchestrator(adapter: &MemoryAdapter) -> Arc<PipelineOrchestrator> {
        let mut registry = Registry::new();
        registry.register_adapter("memory", Arc::new(adapter.clone()));
        let registry = Arc::new(registry);

        let fast = ConnectionConfig::new("memory").with_connect(ConnectSettings {
            attempts: 1,
            backoff_ms: 1,
        });
        let configs = BTreeMap::from([("src".to_string(), fast.clone()), ("dst".to_string(), fast)]);
        let connections = Arc::new(ConnectionManager::new(Arc::clone(&registry), configs));
        Arc::new(PipelineOrchestrator::new(connections, registry, HashMap::new()))
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_ms: 10,
            max_concurrency: 2,
            grace_period_ms: 1_000,
            window: WindowPolicy::Daily,
        }
    }

    fn scheduler(adapter: &MemoryAdapter, jobs: Vec<JobDefinition>) -> (JobScheduler, Arc<MemoryHistory>) {
        let history = Arc::new(MemoryHistory::new());
        let scheduler = JobScheduler::new(
            config(),
            JobSet::build(jobs).unwrap(),
            orchestrator(adapter),
            history.clone(),
            Arc::new(LogNotifier),
        );
        (scheduler, history)
    }

    #[test]
    fn test_job_set_rejects_bad_schedule() {
        let mut bad = job("a", "t");
        bad.schedule = "61 * * * *".to_string();
        let err = JobSet::build(vec![bad]).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { ref job, .. } if job == "a"));
    }

    #[test]
    fn test_queue_orders_by_due_then_arrival() {
        let mut state = LoopState::default();
        let t0 = Utc::now();
        let later = t0 + chrono::Duration::seconds(5);
        let window = RunWindow::new("w");
        state.enqueue(later, "late".into(), 1, window.clone(), vec![]);
        state.enqueue(t0, "first".into(), 1, window.clone(), vec![]);
        state.enqueue(t0, "second".into(), 1, window, vec![]);

        let order: Vec<String> = std::iter::from_fn(|| state.queue.pop().map(|Reverse(q)| q.job_id)).collect();
        assert_eq!(order, vec!["first", "second", "late"]);
    }

    #[tokio::test]
    async fn test_run_job_retries_failed_attempt() {
        let adapter = MemoryAdapter::new();
        adapter.load_table("t", vec![batch(3)]);
        // Exhausts the in-attempt write retries once
        adapter.fail_writes(3);

        let retrying = job("a", "t").with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 5,
            jitter_fraction: 0.0,
            ..RetryPolicy::default()
        });
        let (scheduler, history) = scheduler(&adapter, vec![retrying]);

        let run = scheduler.run_job("a").await.unwrap();
        assert_eq!(run.state, RunState::Succeeded);
        assert_eq!(run.attempt, 2);

        let attempts: Vec<RunState> = history.snapshot().iter().map(|r| r.state).collect();
        assert_eq!(attempts, vec![RunState::Failed, RunState::Succeeded]);
        assert_eq!(adapter.written_rows("a").len(), 3);
    }

    #[tokio::test]
    async fn test_trigger_now_runs_and_rejects_duplicates() {
        let adapter = MemoryAdapter::new();
        adapter.load_table("t", vec![batch(2)]);
        let (scheduler, history) = scheduler(&adapter, vec![job("a", "t")]);

        assert!(matches!(
            scheduler.trigger_now("missing"),
            Err(SchedulerError::UnknownJob(_))
        ));

        scheduler.start().unwrap();
        scheduler.trigger_now("a").unwrap();
        assert!(matches!(scheduler.trigger_now("a"), Err(SchedulerError::AlreadyRunning(_))));

        for _ in 0..200 {
            if scheduler.status().in_flight.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.stop().await;

        let runs = history.snapshot();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].state, RunState::Succeeded);
        assert_eq!(adapter.written_rows("a").len(), 2);
        assert!(matches!(scheduler.trigger_now("a"), Err(SchedulerError::Stopped)));
    }

    #[tokio::test]
    async fn test_failed_prerequisite_skips_dependents() {
        let adapter = MemoryAdapter::new();
        adapter.load_table("t", vec![batch(1)]);
        let jobs = vec![
            job("a", "missing_table").with_retry(RetryPolicy::none()),
            job("b", "t").with_dependencies(["a"]),
            job("c", "t").with_dependencies(["b"]),
        ];
        let (scheduler, history) = scheduler(&adapter, jobs);

        let run = scheduler.run_job("a").await.unwrap();
        assert_eq!(run.state, RunState::Failed);

        let by_job = history.by_job();
        assert_eq!(by_job["b"][0].state, RunState::Skipped);
        assert_eq!(by_job["c"][0].state, RunState::Skipped);
        assert_eq!(scheduler.tracker().summary().total, 1);
    }

    #[tokio::test]
    async fn test_builder_installs_shared_tracker() {
        let adapter = MemoryAdapter::new();
        let tracker = Arc::new(ErrorTracker::default());
        let history = Arc::new(MemoryHistory::new());
        let scheduler = JobScheduler::builder(
            config(),
            JobSet::build(vec![job("a", "missing_table").with_retry(RetryPolicy::none())]).unwrap(),
            orchestrator(&adapter),
            history,
            Arc::new(LogNotifier),
        )
        .tracker(Arc::clone(&tracker))
        .retry_handler(RetryHandler::with_seed(7))
        .build();

        assert!(Arc::ptr_eq(scheduler.tracker(), &tracker));

        let run = scheduler.run_job("a").await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(tracker.summary().total, 1);
    }

    #[tokio::test]
    async fn test_window_rollover_skips_waiting_dependent() {
        let adapter = MemoryAdapter::new();
        let mut hourly = job("b", "t").with_dependencies(["a"]);
        hourly.schedule = "0 * * * *".to_string();
        let (scheduler, history) = scheduler(&adapter, vec![job("a", "t"), hourly]);
        let shared = &scheduler.shared;

        let day_one = Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap();
        {
            let mut state = shared.lock_state();
            state.last_tick = Some(day_one);
            state.window = Some(shared.config.window.window_for(day_one));
        }

        // Fires at 10:00 but its prerequisite never reports
        shared.tick(day_one + chrono::Duration::hours(1)).await;
        shared.promote_waiting().await;
        assert_eq!(scheduler.status().waiting, vec!["b".to_string()]);
        assert!(history.snapshot().is_empty());

        let day_two = Utc.with_ymd_and_hms(2026, 10, 20, 0, 30, 0).unwrap();
        shared.tick(day_two).await;

        let runs = history.snapshot();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, "b");
        assert_eq!(runs[0].state, RunState::Skipped);
        assert_eq!(runs[0].window, RunWindow::new("2026-10-19"));
        assert_eq!(runs[0].last_error.as_ref().unwrap().kind, ErrorKind::Dependency);

        let status = scheduler.status();
        assert!(status.waiting.is_empty());
        assert_eq!(status.window, Some(RunWindow::new("2026-10-20")));
    }
}
