//! Wires a loaded configuration into a running engine.
//!
//! The engine owns one instance of each component and hands them to each
//! other explicitly. Reloads build the new job set first and only touch
//! connections and rulesets once it is known to be valid.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::adapters::notify::build_notifier;
use crate::adapters::Registry;
use crate::config::watch::{ConfigWatcher, WatchHandle};
use crate::config::Config;
use crate::core::connection::ConnectionManager;
use crate::core::history::{open_history, RunHistory};
use crate::core::orchestrator::{PipelineOrchestrator, RunObserver};
use crate::core::scheduler::{JobScheduler, JobSet};
use crate::core::tracker::ErrorTracker;

pub struct Engine {
    registry: Arc<Registry>,
    orchestrator: Arc<PipelineOrchestrator>,
    history: Arc<dyn RunHistory>,
    scheduler: JobScheduler,
    checksum: String,
}

impl Engine {
    /// Validate `config` and build every component from it
    pub async fn build(config: Config, registry: Arc<Registry>) -> Result<Self> {
        Self::build_with_observer(config, registry, None).await
    }

    pub async fn build_with_observer(
        config: Config,
        registry: Arc<Registry>,
        observer: Option<Arc<dyn RunObserver>>,
    ) -> Result<Self> {
        config.validate(&registry)?;

        tokio::fs::create_dir_all(&config.home)
            .await
            .with_context(|| format!("Failed to create state directory {}", config.home.display()))?;

        let history = open_history(&config.settings.history, &config.home)
            .await
            .context("Failed to open run history")?;

        let connections = Arc::new(ConnectionManager::new(Arc::clone(&registry), config.connections.clone()));
        let mut orchestrator = PipelineOrchestrator::new(connections, Arc::clone(&registry), config.rulesets.clone())
            .with_history(Arc::clone(&history));
        if let Some(observer) = observer {
            orchestrator = orchestrator.with_observer(observer);
        }
        let orchestrator = Arc::new(orchestrator);

        let notifier = build_notifier(&config.settings.notifications)?;
        let tracker = Arc::new(ErrorTracker::new(config.settings.errors.clone()));

        let jobs = JobSet::build(config.jobs.clone())?;
        let scheduler = JobScheduler::builder(
            config.settings.scheduler.clone(),
            jobs,
            Arc::clone(&orchestrator),
            Arc::clone(&history),
            notifier,
        )
        .tracker(tracker)
        .build();

        info!(
            jobs = config.jobs.len(),
            connections = config.connections.len(),
            home = %config.home.display(),
            "Engine ready"
        );

        Ok(Self {
            registry,
            orchestrator,
            history,
            scheduler,
            checksum: config.checksum,
        })
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn history(&self) -> &Arc<dyn RunHistory> {
        &self.history
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Install a new configuration version.
    ///
    /// On error nothing changes. Scheduler settings and history location
    /// take effect on restart only.
    pub fn apply(&mut self, config: Config) -> Result<()> {
        config.validate(&self.registry)?;
        self.scheduler.reload(config.jobs)?;
        self.orchestrator.connections().reconfigure(config.connections);
        self.orchestrator.set_rulesets(config.rulesets);
        self.checksum = config.checksum;
        info!("Configuration applied");
        Ok(())
    }

    /// Run the scheduler until ctrl-c, applying config changes from `watcher`
    pub async fn serve(mut self, watcher: Option<ConfigWatcher>) -> Result<()> {
        let (mut updates, handle): (Option<mpsc::Receiver<Config>>, Option<WatchHandle>) = match watcher {
            Some(watcher) => {
                let (rx, handle) = watcher.watch(self.checksum.clone())?;
                (Some(rx), Some(handle))
            }
            None => (None, None),
        };

        self.scheduler.start()?;

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for ctrl-c")?;
                    info!("Shutdown requested");
                    break;
                }
                Some(config) = next_update(&mut updates) => {
                    if let Err(e) = self.apply(config) {
                        error!(error = %format!("{:#}", e), "Config reload rejected, keeping current version");
                    }
                }
            }
        }

        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.scheduler.stop().await;
        Ok(())
    }
}

/// Next config update, or pending forever without a watcher
async fn next_update(updates: &mut Option<mpsc::Receiver<Config>>) -> Option<Config> {
    match updates {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
