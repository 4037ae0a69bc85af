//! Drives one job's extract, validate, transform and load lifecycle.
//!
//! Batches are pulled lazily from the source and pushed through the stages
//! one at a time, so memory is bounded by batch size. Every stage error is
//! classified into a `PipelineError` here; nothing escapes unclassified.
//!
//! Waiting for a batch to arrive or to be written is bounded by the
//! connection's `batch_timeout_ms` and interrupted by cancellation.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::{AdapterError, ExtractRequest, Registry, StepError, TransformStep, Watermark};
use crate::domain::{
    JobDefinition, PipelineError, PipelineRun, RecordBatch, Rule, RunError, RunEvent, RunState, Ruleset, Severity,
    StepConfig, ValidationStage, WindowPolicy,
};

use super::connection::{ConnectionManager, PooledConnection};
use super::history::RunHistory;
use super::validator::DataValidator;

/// Receives every run state change
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// Observer that ignores events
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn on_event(&self, _event: &RunEvent) {}
}

impl RunObserver for mpsc::UnboundedSender<RunEvent> {
    fn on_event(&self, event: &RunEvent) {
        // A closed receiver just means nobody is listening any more
        let _ = self.send(event.clone());
    }
}

/// Main pipeline orchestrator
pub struct PipelineOrchestrator {
    connections: Arc<ConnectionManager>,
    registry: Arc<Registry>,
    validator: DataValidator,
    rulesets: ArcSwap<HashMap<String, Arc<Ruleset>>>,
    observer: Arc<dyn RunObserver>,
    history: Option<Arc<dyn RunHistory>>,
}

/// Connections a run holds while it streams
enum Leases {
    /// Source and target name the same connection
    Shared(PooledConnection),
    Split {
        source: PooledConnection,
        target: PooledConnection,
    },
}

impl Leases {
    /// Acquire both ends, one lease when they coincide.
    ///
    /// Distinct connections are taken in name order, so two runs moving data
    /// in opposite directions cannot each hold the lease the other waits for.
    async fn acquire(manager: &ConnectionManager, source: &str, target: &str) -> Result<Self, PipelineError> {
        if source == target {
            return Ok(Leases::Shared(manager.acquire(source).await?));
        }

        let (first, second) = if source < target { (source, target) } else { (target, source) };
        let held = manager.acquire(first).await?;
        let other = match manager.acquire(second).await {
            Ok(other) => other,
            Err(e) => {
                manager.release(held).await;
                return Err(e.into());
            }
        };

        Ok(if source < target {
            Leases::Split {
                source: held,
                target: other,
            }
        } else {
            Leases::Split {
                source: other,
                target: held,
            }
        })
    }

    fn source(&mut self) -> &mut PooledConnection {
        match self {
            Leases::Shared(conn) => conn,
            Leases::Split { source, .. } => source,
        }
    }

    fn target(&mut self) -> &mut PooledConnection {
        match self {
            Leases::Shared(conn) => conn,
            Leases::Split { target, .. } => target,
        }
    }

    async fn release(self, manager: &ConnectionManager) {
        match self {
            Leases::Shared(conn) => manager.release(conn).await,
            Leases::Split { source, target } => {
                manager.release(source).await;
                manager.release(target).await;
            }
        }
    }
}

impl PipelineOrchestrator {
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<Registry>,
        rulesets: HashMap<String, Ruleset>,
    ) -> Self {
        let validator = DataValidator::new(registry.resolvers());
        Self {
            connections,
            registry,
            validator,
            rulesets: ArcSwap::from_pointee(wrap_rulesets(rulesets)),
            observer: Arc::new(NoopObserver),
            history: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// History consulted for the high-water mark of incremental jobs
    pub fn with_history(mut self, history: Arc<dyn RunHistory>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Replace the ruleset table; runs already past lookup keep their copy
    pub fn set_rulesets(&self, rulesets: HashMap<String, Ruleset>) {
        self.rulesets.store(Arc::new(wrap_rulesets(rulesets)));
    }

    /// Run one attempt of `job` in the current daily window
    pub async fn run(&self, job: &JobDefinition, attempt: u32) -> PipelineRun {
        let window = WindowPolicy::Daily.window_for(Utc::now());
        let run = PipelineRun::new(job, attempt, window);
        self.execute(job, run, &CancellationToken::new()).await
    }

    /// Drive a pending run to a terminal state.
    ///
    /// `cancel` is checked between batches; a cancelled run ends `Aborted`.
    #[instrument(skip(self, job, run, cancel), fields(job = %job.id, run_id = %run.id, attempt = run.attempt))]
    pub async fn execute(&self, job: &JobDefinition, mut run: PipelineRun, cancel: &CancellationToken) -> PipelineRun {
        run.started_at = Some(Utc::now());
        info!(window = %run.window, "Starting run");

        match self.drive(job, &mut run, cancel).await {
            Ok(()) => {
                run.finished_at = Some(Utc::now());
                self.transition(&mut run, RunState::Succeeded);
                info!(
                    rows_read = run.rows_read,
                    rows_written = run.rows_written,
                    rows_dropped = run.rows_dropped,
                    batches = run.batches,
                    "Run succeeded"
                );
            }
            Err(e) => self.handle_failure(&mut run, e),
        }

        run
    }

    fn handle_failure(&self, run: &mut PipelineRun, err: PipelineError) {
        let error = RunError::from(&err);
        run.last_error = Some(error.clone());
        run.finished_at = Some(Utc::now());

        if matches!(err, PipelineError::Cancelled) {
            warn!(state = %run.state, batches = run.batches, "Run aborted");
            self.transition(run, RunState::Aborted);
        } else {
            error!(state = %run.state, kind = %error.kind, error = %err, "Run failed");
            self.transition(run, RunState::Failed);
        }
    }

    fn transition(&self, run: &mut PipelineRun, to: RunState) {
        let from = run.state;
        debug_assert!(from.can_transition_to(to), "illegal transition {} -> {}", from, to);
        run.state = to;
        debug!(%from, %to, batch = run.batches, "State change");

        let mut event = RunEvent::transition(run, from, to);
        if to == RunState::Failed {
            if let Some(e) = &run.last_error {
                event = event.with_error(e.to_string());
            }
        }
        self.observer.on_event(&event);
    }

    fn ruleset_for(&self, job: &JobDefinition) -> Result<Arc<Ruleset>, PipelineError> {
        match &job.transform_ruleset {
            None => Ok(Arc::new(Ruleset::default())),
            Some(name) => self
                .rulesets
                .load()
                .get(name)
                .cloned()
                .ok_or_else(|| PipelineError::Configuration(format!("unknown ruleset '{}'", name))),
        }
    }

    async fn drive(&self, job: &JobDefinition, run: &mut PipelineRun, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let ruleset = self.ruleset_for(job)?;

        let watermark = self.watermark_for(job).await?;
        run.watermark_from = watermark.as_ref().map(|w| w.after.clone());
        run.high_water_mark = run.watermark_from.clone();

        let mut leases = Leases::acquire(&self.connections, &job.source.connection, &job.target.connection).await?;
        let result = self
            .stream_batches(job, run, &ruleset, &mut leases, watermark, cancel)
            .await;
        leases.release(&self.connections).await;
        result
    }

    /// Where an incremental job left off, if it has run before
    async fn watermark_for(&self, job: &JobDefinition) -> Result<Option<Watermark>, PipelineError> {
        let Some(column) = &job.source.incremental_column else {
            return Ok(None);
        };
        let Some(history) = &self.history else {
            debug!(%column, "No history attached, extracting in full");
            return Ok(None);
        };

        let mark = history.last_watermark(&job.id).await.map_err(|e| PipelineError::Extract {
            source_id: job.source.connection.clone(),
            message: format!("cannot read high-water mark: {:#}", e),
        })?;
        if let Some(after) = &mark {
            info!(%column, after = %after, "Extracting incrementally");
        }
        Ok(mark.map(|after| Watermark::new(column.clone(), after)))
    }

    async fn stream_batches(
        &self,
        job: &JobDefinition,
        run: &mut PipelineRun,
        ruleset: &Ruleset,
        leases: &mut Leases,
        watermark: Option<Watermark>,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        self.transition(run, RunState::Extracting);

        let source_id = job.source.connection.clone();
        let extract_error = |message: String| PipelineError::Extract {
            source_id: source_id.clone(),
            message,
        };

        let request = ExtractRequest::new(job.source.query.clone(), job.batch_size)
            .with_schema(job.source.schema.clone())
            .with_watermark(watermark);
        let wait = leases.source().config().batch_timeout();

        let opened = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            opened = tokio::time::timeout(wait, leases.source().extract(&request)) => opened,
        };
        let mut batches = opened
            .map_err(|_| extract_error(format!("source did not start within {}ms", wait.as_millis())))?
            .map_err(|e| extract_error(e.to_string()))?;

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if run.state == RunState::Loading {
                self.transition(run, RunState::Extracting);
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                next = tokio::time::timeout(wait, batches.next()) => next,
            };
            let batch = match next {
                Err(_) => return Err(extract_error(format!("no batch within {}ms", wait.as_millis()))),
                Ok(None) => break,
                Ok(Some(Ok(batch))) => batch,
                Ok(Some(Err(e))) => return Err(extract_error(e.to_string())),
            };
            run.batches += 1;
            run.rows_read += batch.num_rows() as u64;
            if let Some(column) = &job.source.incremental_column {
                advance_mark(run, column, &batch);
            }
            debug!(batch = run.batches, rows = batch.num_rows(), "Extracted batch");

            self.transition(run, RunState::Validating(ValidationStage::PostExtract));
            let batch = self.gate(run, batch, &ruleset.validation.post_extract, ValidationStage::PostExtract)?;

            self.transition(run, RunState::Transforming);
            let batch = self.transform(run, batch, &ruleset.steps)?;

            self.transition(run, RunState::Validating(ValidationStage::PostTransform));
            let batch = self.gate(run, batch, &ruleset.validation.post_transform, ValidationStage::PostTransform)?;

            self.transition(run, RunState::Loading);
            run.rows_written += self.load(job, leases.target(), &batch, cancel).await?;
        }

        Ok(())
    }

    /// Validate a batch; warn violations tag rows, fail violations stop the run
    fn gate(
        &self,
        run: &mut PipelineRun,
        mut batch: RecordBatch,
        rules: &[Rule],
        stage: ValidationStage,
    ) -> Result<RecordBatch, PipelineError> {
        if rules.is_empty() {
            return Ok(batch);
        }

        let result = self.validator.validate(&batch, rules);
        for violation in &result.violations {
            if violation.severity == Severity::Warn {
                if let Some(row) = violation.row {
                    batch.tag_row(row, violation.rule.clone());
                }
            }
            run.record_violation(violation.clone());
        }

        if !result.passed {
            let failures: Vec<_> = result.failures().collect();
            let message = failures.first().map(|v| v.message.clone()).unwrap_or_default();
            return Err(PipelineError::Validation {
                stage,
                violations: failures.len(),
                message,
            });
        }

        let warnings = result.warnings().count();
        if warnings > 0 {
            warn!(%stage, warnings, batch = run.batches, "Validation warnings");
        }
        Ok(batch)
    }

    /// Apply the transform chain in declared order
    fn transform(&self, run: &mut PipelineRun, batch: RecordBatch, steps: &[StepConfig]) -> Result<RecordBatch, PipelineError> {
        let mut current = batch;

        for step in steps {
            let transform = self.registry.transform(&step.kind).ok_or_else(|| {
                PipelineError::Configuration(format!("step '{}' uses unknown transform '{}'", step.name, step.kind))
            })?;

            current = match transform.apply(&current, &step.params) {
                Ok(out) => {
                    run.rows_dropped += out.dropped.len() as u64;
                    out.batch
                }
                Err(e) if step.skip_on_error => {
                    let kept = skip_failing_rows(run, step, transform.as_ref(), current, e)?;
                    if kept.is_empty() {
                        return Ok(kept);
                    }
                    kept
                }
                Err(e) => {
                    return Err(PipelineError::Transformation {
                        step: step.name.clone(),
                        message: e.message,
                    })
                }
            };
        }

        Ok(current)
    }

    /// Write one batch, retrying transient failures at the batch level
    async fn load(
        &self,
        job: &JobDefinition,
        target: &mut PooledConnection,
        batch: &RecordBatch,
        cancel: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let attempts = target.config().write_attempts.max(1);
        let connect = target.config().connect.clone();
        let wait = target.config().batch_timeout();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let written = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                written = tokio::time::timeout(wait, target.write_batch(&job.target.table, batch)) => written,
            };
            match written.unwrap_or_else(|_| Err(write_timed_out(wait))) {
                Ok(written) => return Ok(written as u64),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = connect.backoff(attempt);
                    warn!(
                        table = %job.target.table,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Batch write failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(PipelineError::Load {
                        target: format!("{}.{}", job.target.connection, job.target.table),
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

fn write_timed_out(wait: Duration) -> AdapterError {
    AdapterError::Transient(format!("write did not finish within {}ms", wait.as_millis()))
}

/// Re-apply a skip-on-error step, dropping the rows it reports each time,
/// until it accepts what is left.
///
/// An error naming no rows drops the rest of the batch. The step fails for
/// good when it names rows the batch no longer has or rejects every row.
fn skip_failing_rows(
    run: &mut PipelineRun,
    step: &StepConfig,
    transform: &dyn TransformStep,
    mut batch: RecordBatch,
    mut err: StepError,
) -> Result<RecordBatch, PipelineError> {
    let failed = |message: String| PipelineError::Transformation {
        step: step.name.clone(),
        message,
    };

    loop {
        if err.rows.is_empty() {
            warn!(step = %step.name, rows = batch.num_rows(), error = %err, "Step failed, dropping batch");
            run.rows_dropped += batch.num_rows() as u64;
            return Ok(RecordBatch::empty(Arc::clone(&batch.schema)));
        }

        let dropped = batch.drop_rows(&err.rows);
        if dropped == 0 {
            return Err(failed(format!("{} (no remaining row to skip)", err.message)));
        }
        run.rows_dropped += dropped as u64;
        warn!(step = %step.name, dropped, error = %err, "Step failed, dropping offending rows");

        if batch.is_empty() {
            return Err(failed(format!("{} (every row was rejected)", err.message)));
        }

        match transform.apply(&batch, &step.params) {
            Ok(out) => {
                run.rows_dropped += out.dropped.len() as u64;
                return Ok(out.batch);
            }
            Err(next) => err = next,
        }
    }
}

/// Raise the run's high-water mark to the largest value in `column`
fn advance_mark(run: &mut PipelineRun, column: &str, batch: &RecordBatch) {
    let Some(idx) = batch.schema.index_of(column) else {
        return;
    };
    for value in batch.rows.iter().filter_map(|row| row.get(idx)) {
        if value.is_null() {
            continue;
        }
        let newer = match &run.high_water_mark {
            None => true,
            Some(mark) => value.compare(mark) == Some(Ordering::Greater),
        };
        if newer {
            run.high_water_mark = Some(value.clone());
        }
    }
}

fn wrap_rulesets(rulesets: HashMap<String, Ruleset>) -> HashMap<String, Arc<Ruleset>> {
    rulesets.into_iter().map(|(name, r)| (name, Arc::new(r))).collect()
}
