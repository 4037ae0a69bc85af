//! Config file watching for hot reload.
//!
//! The watcher observes the config file's directory (editors often replace
//! files rather than write them in place), debounces bursts of events, and
//! only reloads when the file's SHA-256 checksum actually changed. A file
//! that fails to load or validate is logged and ignored; consumers keep the
//! configuration they already have.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::Config;
use crate::adapters::Registry;

/// Hex SHA-256 of a byte slice
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Handle to a running watcher; dropping it stops watching
pub struct WatchHandle {
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Watches one config file and yields each new valid version
pub struct ConfigWatcher {
    path: PathBuf,
    environment: Option<String>,
    registry: Arc<Registry>,
    debounce: Duration,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, environment: Option<String>, registry: Arc<Registry>) -> Self {
        Self {
            path: path.into(),
            environment,
            registry,
            debounce: Duration::from_millis(500),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Start watching.
    ///
    /// `current_checksum` is the checksum of the version already in use;
    /// events that leave the content unchanged are ignored.
    pub fn watch(self, current_checksum: String) -> Result<(mpsc::Receiver<Config>, WatchHandle)> {
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<()>();
        let target = self.path.clone();
        let mut debouncer = new_debouncer(self.debounce, move |result: DebounceEventResult| match result {
            Ok(events) => {
                if events.iter().any(|e| same_file(&e.path, &target)) {
                    let _ = event_tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "Config watcher error"),
        })
        .context("Failed to create config watcher")?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        info!(path = %self.path.display(), "Watching config file for changes");

        let (config_tx, config_rx) = mpsc::channel::<Config>(4);
        let task = tokio::spawn(async move {
            // Owned by the task so watching lasts as long as it does
            let _debouncer = debouncer;
            let mut checksum = current_checksum;

            while event_rx.recv().await.is_some() {
                match self.reload(&checksum).await {
                    Ok(Some(config)) => {
                        checksum = config.checksum.clone();
                        if config_tx.send(config).await.is_err() {
                            debug!("Config receiver dropped, stopping watcher");
                            break;
                        }
                    }
                    Ok(None) => debug!("Config content unchanged, ignoring event"),
                    Err(e) => error!(error = %format!("{:#}", e), "Config reload rejected, keeping current version"),
                }
            }
        });

        Ok((config_rx, WatchHandle { task }))
    }

    /// Load and validate the file if its content changed
    async fn reload(&self, current: &str) -> Result<Option<Config>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if checksum(&bytes) == current {
            return Ok(None);
        }

        let config = Config::load(&self.path, self.environment.as_deref())?;
        config.validate(&self.registry)?;
        info!(path = %self.path.display(), jobs = config.jobs.len(), "Config change detected");
        Ok(Some(config))
    }
}

fn same_file(event_path: &Path, target: &Path) -> bool {
    if event_path == target {
        return true;
    }
    match (event_path.canonicalize(), target.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => event_path.file_name() == target.file_name(),
    }
}
