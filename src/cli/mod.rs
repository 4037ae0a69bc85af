//! Command-line interface for sluice.
//!
//! Provides commands for running a job once, listing jobs, inspecting run
//! history, validating configuration and serving the scheduler.
//!
//! Exit codes: 0 success, 1 run failure, 2 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::adapters::Registry;
use crate::config::watch::ConfigWatcher;
use crate::config::Config;
use crate::core::history::{open_history, HistoryQuery, RunHistory};
use crate::core::schedule::Schedule;
use crate::domain::{PipelineRun, RunState};
use crate::engine::Engine;

/// sluice - dependency-ordered ETL job scheduler
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to .sluice/config.yaml in this or a parent directory)
    #[arg(short, long, global = true, env = "SLUICE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Environment overlay to apply from the config's `environments` section
    #[arg(short, long, global = true, env = "SLUICE_ENV")]
    pub env: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "SLUICE_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// How log lines are rendered on stderr
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one job now, with retries, and wait for its outcome
    Run {
        /// Job id
        job_id: String,
    },

    /// List configured jobs
    List,

    /// Show one run from history
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Only runs of this job
        #[arg(short, long)]
        job: Option<String>,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Check the configuration without running anything
    Validate,

    /// Run the scheduler until interrupted
    Serve {
        /// Reload the configuration when the file changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Show resolved configuration (debug)
    Config,
}

const EXIT_RUN_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        let registry = Arc::new(Registry::with_builtins());

        let config = match self.load_config(&registry) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Configuration error: {:#}", e);
                return Ok(ExitCode::from(EXIT_CONFIG));
            }
        };

        match self.command {
            Commands::Run { job_id } => run_job(config, registry, &job_id).await,
            Commands::List => list_jobs(&config),
            Commands::Status { run_id } => show_status(&config, &run_id).await,
            Commands::Runs { job, limit } => list_runs(&config, job, limit).await,
            Commands::Validate => {
                println!(
                    "Configuration OK: {} job(s), {} connection(s), {} ruleset(s)",
                    config.jobs.len(),
                    config.connections.len(),
                    config.rulesets.len()
                );
                Ok(ExitCode::SUCCESS)
            }
            Commands::Serve { watch } => serve(config, registry, watch, self.env).await,
            Commands::Config => show_config(&config, self.env.as_deref()),
        }
    }

    fn load_config(&self, registry: &Registry) -> Result<Config> {
        let path = Config::discover(self.config.as_deref())?;
        let config = Config::load(&path, self.env.as_deref())?;
        config.validate(registry)?;
        Ok(config)
    }
}

/// Run a job once and report its outcome
async fn run_job(config: Config, registry: Arc<Registry>, job_id: &str) -> Result<ExitCode> {
    if config.job(job_id).is_none() {
        eprintln!("Configuration error: unknown job '{}'", job_id);
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    let engine = Engine::build(config, registry).await?;
    let run = engine.scheduler().run_job(job_id).await?;
    engine.scheduler().stop().await;

    print_run(&run);
    match run.state {
        RunState::Succeeded => {
            eprintln!("\n[Run {} succeeded]", run.id);
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            eprintln!(
                "\n[Run {} {}: {}]",
                run.id,
                run.state,
                run.error_summary().unwrap_or_else(|| "no error recorded".to_string())
            );
            Ok(ExitCode::from(EXIT_RUN_FAILED))
        }
    }
}

/// List configured jobs with their next fire time
fn list_jobs(config: &Config) -> Result<ExitCode> {
    if config.jobs.is_empty() {
        println!("No jobs configured");
        return Ok(ExitCode::SUCCESS);
    }

    let now = Utc::now();
    println!("{:<24} {:<16} {:<24} {:<8} {:<20}", "JOB", "SCHEDULE", "DEPENDS ON", "ENABLED", "NEXT RUN");
    println!("{}", "-".repeat(96));

    for job in &config.jobs {
        let next = Schedule::parse(&job.schedule)
            .ok()
            .and_then(|s| s.next_after(now))
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let deps = if job.depends_on.is_empty() {
            "-".to_string()
        } else {
            job.depends_on.join(",")
        };
        println!(
            "{:<24} {:<16} {:<24} {:<8} {:<20}",
            job.id,
            job.schedule,
            deps,
            if job.enabled { "yes" } else { "no" },
            next
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn history(config: &Config) -> Result<Arc<dyn RunHistory>> {
    open_history(&config.settings.history, &config.home)
        .await
        .context("Failed to open run history")
}

/// Show the status of a run
async fn show_status(config: &Config, run_id_str: &str) -> Result<ExitCode> {
    let run_id = Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let Some(run) = history(config).await?.get(run_id).await? else {
        anyhow::bail!("Run {} not found", run_id);
    };

    print_run(&run);
    if !run.violations.is_empty() {
        println!("\nViolations:");
        for v in &run.violations {
            let row = v.row.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string());
            println!("  [{:?}] {} (row {}): {}", v.severity, v.rule, row, v.message);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// List recent runs
async fn list_runs(config: &Config, job: Option<String>, limit: usize) -> Result<ExitCode> {
    let query = HistoryQuery {
        job_id: job,
        ..HistoryQuery::default()
    }
    .with_limit(limit);
    let runs = history(config).await?.list(&query).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<38} {:<24} {:<8} {:<12} {:<12} {:<10}",
        "RUN ID", "JOB", "ATTEMPT", "STATE", "WINDOW", "ROWS"
    );
    println!("{}", "-".repeat(108));

    for run in runs {
        println!(
            "{:<38} {:<24} {:<8} {:<12} {:<12} {}/{}",
            run.id,
            run.job_id,
            run.attempt,
            run.state.to_string(),
            run.window.to_string(),
            run.rows_written,
            run.rows_read
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Run the scheduler in the foreground
async fn serve(config: Config, registry: Arc<Registry>, watch: bool, env: Option<String>) -> Result<ExitCode> {
    let source = config.source.clone();
    let engine = Engine::build(config, Arc::clone(&registry)).await?;

    let watcher = match (watch, source) {
        (true, Some(path)) => Some(ConfigWatcher::new(path, env, registry)),
        (true, None) => anyhow::bail!("--watch needs a config file"),
        (false, _) => None,
    };

    engine.serve(watcher).await?;
    Ok(ExitCode::SUCCESS)
}

/// Show resolved configuration
fn show_config(config: &Config, env: Option<&str>) -> Result<ExitCode> {
    println!("sluice configuration");
    println!("====================");
    println!();

    match &config.source {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none)"),
    }
    println!("Environment: {}", env.unwrap_or("(base)"));
    println!("Home:        {}", config.home.display());
    println!("Checksum:    {}", &config.checksum[..12.min(config.checksum.len())]);
    println!();

    println!("Settings:");
    let settings = serde_yaml::to_string(&config.settings).context("Failed to render settings")?;
    for line in settings.lines() {
        println!("  {}", line);
    }
    println!();

    println!("Connections:");
    for (name, conn) in &config.connections {
        println!(
            "  {:<20} adapter={} pool={}..{} (+{})",
            name, conn.adapter, conn.pool.min, conn.pool.max, conn.pool.increment
        );
    }

    let mut rulesets: Vec<&str> = config.rulesets.keys().map(String::as_str).collect();
    rulesets.sort_unstable();
    println!();
    if rulesets.is_empty() {
        println!("Rulesets: -");
    } else {
        println!("Rulesets: {}", rulesets.join(", "));
    }
    println!("Jobs:     {}", config.jobs.len());

    Ok(ExitCode::SUCCESS)
}

fn print_run(run: &PipelineRun) {
    println!("Run ID:   {}", run.id);
    println!("Job:      {}", run.job_id);
    println!("Attempt:  {}", run.attempt);
    println!("State:    {}", run.state);
    println!("Window:   {}", run.window);
    if let Some(started) = run.started_at {
        println!("Started:  {}", started);
    }
    if let Some(finished) = run.finished_at {
        println!("Finished: {}", finished);
    }
    println!(
        "Rows:     {} read, {} written, {} dropped ({} batch(es), {} warning(s))",
        run.rows_read, run.rows_written, run.rows_dropped, run.batches, run.warnings
    );
    if !run.triggered_by.is_empty() {
        let ids: Vec<String> = run.triggered_by.iter().map(Uuid::to_string).collect();
        println!("Triggered by: {}", ids.join(", "));
    }
    if let Some(summary) = run.error_summary() {
        println!("Error:    {}", summary);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let cli = Cli::try_parse_from(["sluice", "--env", "prod", "runs", "--job", "orders", "-l", "5"]).unwrap();
        assert_eq!(cli.env.as_deref(), Some("prod"));
        assert!(matches!(
            cli.command,
            Commands::Runs { job: Some(ref j), limit: 5 } if j == "orders"
        ));

        let cli = Cli::try_parse_from(["sluice", "serve", "--watch", "--config", "/etc/sluice.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/sluice.yaml")));
        assert!(matches!(cli.command, Commands::Serve { watch: true }));

        assert!(Cli::try_parse_from(["sluice", "run"]).is_err());
    }

    #[test]
    fn test_log_format_flag() {
        let cli = Cli::try_parse_from(["sluice", "list", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);

        let cli = Cli::try_parse_from(["sluice", "--log-format", "text", "list"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);

        assert!(Cli::try_parse_from(["sluice", "--log-format", "xml", "list"]).is_err());
    }
}
