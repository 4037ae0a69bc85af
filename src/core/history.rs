//! Run history sinks.
//!
//! Every terminal run snapshot (including each failed attempt and each
//! propagated skip) is appended once. The engine reads history back only to
//! find where an incremental job left off; `get` and `list` serve the CLI.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::domain::{PipelineRun, RunState, Value};

/// Filters for listing runs
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub job_id: Option<String>,

    /// Only runs created at or after this instant
    pub since: Option<DateTime<Utc>>,

    /// Only runs created at or before this instant
    pub until: Option<DateTime<Utc>>,

    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, run: &PipelineRun) -> bool {
        self.job_id.as_ref().map_or(true, |id| &run.job_id == id)
            && self.since.map_or(true, |t| run.created_at >= t)
            && self.until.map_or(true, |t| run.created_at <= t)
    }

    /// Filter, order newest first, then limit
    fn apply(&self, runs: impl IntoIterator<Item = PipelineRun>) -> Vec<PipelineRun> {
        let mut selected: Vec<PipelineRun> = runs.into_iter().filter(|r| self.matches(r)).collect();
        selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Append-only store of terminal run snapshots
#[async_trait]
pub trait RunHistory: Send + Sync {
    async fn append(&self, run: &PipelineRun) -> Result<()>;

    async fn get(&self, run_id: Uuid) -> Result<Option<PipelineRun>>;

    /// Runs matching `query`, newest first
    async fn list(&self, query: &HistoryQuery) -> Result<Vec<PipelineRun>>;

    /// High-water mark of the newest successful run of `job_id` that has one
    async fn last_watermark(&self, job_id: &str) -> Result<Option<Value>> {
        let runs = self.list(&HistoryQuery::for_job(job_id)).await?;
        Ok(runs
            .into_iter()
            .filter(|r| r.state == RunState::Succeeded)
            .find_map(|r| r.high_water_mark))
    }
}

/// Which history sink to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryBackend {
    #[default]
    Jsonl,
    Sqlite,
    Memory,
}

/// History settings (`settings.history`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySettings {
    #[serde(default)]
    pub backend: HistoryBackend,

    /// File location; defaults to `history.jsonl` / `history.db` under the sluice home
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Open the configured history sink
pub async fn open_history(settings: &HistorySettings, home: &Path) -> Result<Arc<dyn RunHistory>> {
    let history: Arc<dyn RunHistory> = match settings.backend {
        HistoryBackend::Memory => Arc::new(MemoryHistory::default()),
        HistoryBackend::Jsonl => {
            let path = settings.path.clone().unwrap_or_else(|| home.join("history.jsonl"));
            Arc::new(JsonlHistory::open(path).await?)
        }
        HistoryBackend::Sqlite => {
            let path = settings.path.clone().unwrap_or_else(|| home.join("history.db"));
            Arc::new(SqliteHistory::open(&path)?)
        }
    };
    Ok(history)
}

/// Newline-delimited JSON history file
pub struct JsonlHistory {
    path: PathBuf,
}

impl JsonlHistory {
    /// Open a history file, creating its directory if needed
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create history directory: {}", parent.display()))?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Vec<PipelineRun>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open history file: {}", self.path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut runs = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let run: PipelineRun =
                serde_json::from_str(&line).with_context(|| format!("Failed to parse history line: {}", line))?;
            runs.push(run);
        }
        Ok(runs)
    }
}

#[async_trait]
impl RunHistory for JsonlHistory {
    async fn append(&self, run: &PipelineRun) -> Result<()> {
        let json = serde_json::to_string(run).context("Failed to serialize run")?;
        let path = self.path.clone();

        // Several processes may share the file; lock for the duration of the write
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open history file: {}", path.display()))?;
            file.lock_exclusive()
                .context("Failed to acquire lock on history file")?;
            writeln!(file, "{}", json).context("Failed to write run")?;
            file.flush().context("Failed to flush run")?;
            Ok(())
        })
        .await
        .context("History writer task panicked")?
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        Ok(self.read_all().await?.into_iter().rev().find(|r| r.id == run_id))
    }

    async fn list(&self, query: &HistoryQuery) -> Result<Vec<PipelineRun>> {
        Ok(query.apply(self.read_all().await?))
    }
}

/// SQLite-backed history; statements run on the blocking pool
pub struct SqliteHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistory {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create history directory: {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open history database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    /// In-memory database
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS pipeline_runs (
                id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                state TEXT NOT NULL,
                run_window TEXT NOT NULL,
                created_at TEXT NOT NULL,
                finished_at TEXT,
                rows_read INTEGER NOT NULL,
                rows_written INTEGER NOT NULL,
                snapshot TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pipeline_runs_job ON pipeline_runs(job_id);
            CREATE INDEX IF NOT EXISTS idx_pipeline_runs_created ON pipeline_runs(created_at);",
        )
        .context("Failed to create history tables")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = match conn.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f(&guard)
        })
        .await
        .context("History database task panicked")?
    }
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[async_trait]
impl RunHistory for SqliteHistory {
    async fn append(&self, run: &PipelineRun) -> Result<()> {
        let snapshot = serde_json::to_string(run).context("Failed to serialize run")?;
        let run = run.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO pipeline_runs
                 (id, job_id, attempt, state, run_window, created_at, finished_at, rows_read, rows_written, snapshot)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run.id.to_string(),
                    run.job_id,
                    run.attempt,
                    run.state.to_string(),
                    run.window.as_str(),
                    timestamp(run.created_at),
                    run.finished_at.map(timestamp),
                    run.rows_read as i64,
                    run.rows_written as i64,
                    snapshot,
                ],
            )
            .context("Failed to insert run")?;
            Ok(())
        })
        .await
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT snapshot FROM pipeline_runs WHERE id = ?1")?;
            let mut rows = stmt.query_map(params![run_id.to_string()], |row| row.get::<_, String>(0))?;

            match rows.next() {
                Some(snapshot) => {
                    let snapshot = snapshot?;
                    let run = serde_json::from_str(&snapshot).context("Failed to parse stored run")?;
                    Ok(Some(run))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn list(&self, query: &HistoryQuery) -> Result<Vec<PipelineRun>> {
        let query = query.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT snapshot FROM pipeline_runs
                 WHERE (?1 IS NULL OR job_id = ?1)
                   AND (?2 IS NULL OR created_at >= ?2)
                   AND (?3 IS NULL OR created_at <= ?3)
                 ORDER BY created_at DESC
                 LIMIT ?4",
            )?;
            let limit = query.limit.map_or(-1, |l| l as i64);
            let snapshots = stmt.query_map(
                params![
                    query.job_id,
                    query.since.map(timestamp),
                    query.until.map(timestamp),
                    limit
                ],
                |row| row.get::<_, String>(0),
            )?;

            let mut runs = Vec::new();
            for snapshot in snapshots {
                runs.push(serde_json::from_str(&snapshot?).context("Failed to parse stored run")?);
            }
            Ok(runs)
        })
        .await
    }
}

/// Process-local history
#[derive(Default)]
pub struct MemoryHistory {
    runs: Mutex<Vec<PipelineRun>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All appended runs in append order
    pub fn snapshot(&self) -> Vec<PipelineRun> {
        match self.runs.lock() {
            Ok(runs) => runs.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Appended runs grouped by job
    pub fn by_job(&self) -> HashMap<String, Vec<PipelineRun>> {
        let mut grouped: HashMap<String, Vec<PipelineRun>> = HashMap::new();
        for run in self.snapshot() {
            grouped.entry(run.job_id.clone()).or_default().push(run);
        }
        grouped
    }
}

#[async_trait]
impl RunHistory for MemoryHistory {
    async fn append(&self, run: &PipelineRun) -> Result<()> {
        match self.runs.lock() {
            Ok(mut runs) => runs.push(run.clone()),
            Err(poisoned) => poisoned.into_inner().push(run.clone()),
        }
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        Ok(self.snapshot().into_iter().find(|r| r.id == run_id))
    }

    async fn list(&self, query: &HistoryQuery) -> Result<Vec<PipelineRun>> {
        Ok(query.apply(self.snapshot()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobDefinition, RunState, RunWindow, SourceRef, TargetRef};
    use chrono::Duration;
    use tempfile::TempDir;

    fn run(job_id: &str, minutes_ago: i64) -> PipelineRun {
        let job = JobDefinition::new(job_id, "@daily", SourceRef::new("a", "t"), TargetRef::new("b", "t"));
        let mut run = PipelineRun::new(&job, 1, RunWindow::new("2026-10-19"));
        run.created_at = Utc::now() - Duration::minutes(minutes_ago);
        run.state = RunState::Succeeded;
        run.finished_at = Some(run.created_at);
        run
    }

    async fn exercise(history: &dyn RunHistory) {
        let old = run("orders", 30);
        let new = run("orders", 5);
        let other = run("customers", 10);
        for r in [&old, &new, &other] {
            history.append(r).await.unwrap();
        }

        assert_eq!(history.get(old.id).await.unwrap(), Some(old.clone()));
        assert!(history.get(Uuid::new_v4()).await.unwrap().is_none());

        let orders = history.list(&HistoryQuery::for_job("orders")).await.unwrap();
        assert_eq!(orders.iter().map(|r| r.id).collect::<Vec<_>>(), vec![new.id, old.id]);

        let latest = history.list(&HistoryQuery::default().with_limit(1)).await.unwrap();
        assert_eq!(latest[0].id, new.id);

        let recent = HistoryQuery {
            since: Some(Utc::now() - Duration::minutes(15)),
            ..Default::default()
        };
        assert_eq!(history.list(&recent).await.unwrap().len(), 2);
    }

    async fn exercise_watermark(history: &dyn RunHistory) {
        assert_eq!(history.last_watermark("orders").await.unwrap(), None);

        let mut first = run("orders", 30);
        first.high_water_mark = Some(Value::Int(10));
        let mut failed = run("orders", 5);
        failed.state = RunState::Failed;
        failed.high_water_mark = Some(Value::Int(99));
        let mut second = run("orders", 10);
        second.high_water_mark = Some(Value::Int(20));
        for r in [&first, &failed, &second] {
            history.append(r).await.unwrap();
        }

        assert_eq!(history.last_watermark("orders").await.unwrap(), Some(Value::Int(20)));
        assert_eq!(history.last_watermark("customers").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_jsonl_history() {
        let dir = TempDir::new().unwrap();
        let history = JsonlHistory::open(dir.path().join("nested/history.jsonl")).await.unwrap();
        exercise(&history).await;

        let marks = JsonlHistory::open(dir.path().join("marks.jsonl")).await.unwrap();
        exercise_watermark(&marks).await;
    }

    #[tokio::test]
    async fn test_sqlite_history() {
        let history = SqliteHistory::in_memory().unwrap();
        exercise(&history).await;
        exercise_watermark(&SqliteHistory::in_memory().unwrap()).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_sqlite_history_shared_across_tasks() {
        let dir = TempDir::new().unwrap();
        let history = Arc::new(SqliteHistory::open(dir.path().join("history.db")).unwrap());

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let history = Arc::clone(&history);
                tokio::spawn(async move { history.append(&run("orders", i)).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        assert_eq!(history.list(&HistoryQuery::for_job("orders")).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_memory_history() {
        exercise(&MemoryHistory::new()).await;
        exercise_watermark(&MemoryHistory::new()).await;
    }
}
