//! Configuration loading and validation.
//!
//! Configuration sources (highest priority first):
//! 1. `--config` flag / `SLUICE_CONFIG` environment variable
//! 2. `.sluice/config.yaml` in the current directory or any parent
//!
//! The document is processed in this order: the selected
//! `environments.<name>` overlay is merged in, `${VAR}` / `${VAR:default}`
//! references are expanded, files under `jobs_dir` are added to `jobs`, and
//! `defaults` is merged under every job before it is decoded.
//!
//! Relative paths in the file are resolved against the directory holding
//! `.sluice/`. A loaded `Config` is a plain value passed explicitly to the
//! engine; nothing is cached process-wide.

pub mod env;
pub mod watch;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::adapters::notify::NotificationSettings;
use crate::adapters::Registry;
use crate::core::connection::ConnectionConfig;
use crate::core::dependency::DependencyGraph;
use crate::core::history::HistorySettings;
use crate::core::schedule::Schedule;
use crate::core::scheduler::SchedulerConfig;
use crate::core::tracker::TrackerSettings;
use crate::domain::{Check, JobDefinition, Rule, Ruleset};

/// Directory searched for in the current directory and its parents
pub const CONFIG_DIR: &str = ".sluice";
pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("environment variable '{0}' is not set and has no default")]
    MissingVar(String),

    #[error("environment '{0}' is not defined under 'environments'")]
    UnknownEnvironment(String),

    #[error("invalid jobs_dir pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("no config file found (pass --config, set SLUICE_CONFIG, or create .sluice/config.yaml)")]
    NotFound,

    #[error("invalid configuration:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

/// Engine-wide settings (`settings:` section)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// State directory for history files; defaults to `~/.sluice`
    #[serde(default)]
    pub home: Option<PathBuf>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub history: HistorySettings,

    #[serde(default)]
    pub notifications: NotificationSettings,

    #[serde(default)]
    pub errors: TrackerSettings,
}

/// Raw document after overlays and substitution; jobs are decoded separately
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<String>,

    #[serde(default)]
    settings: Settings,

    #[serde(default)]
    connections: BTreeMap<String, ConnectionConfig>,

    #[serde(default)]
    rulesets: HashMap<String, Ruleset>,
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub connections: BTreeMap<String, ConnectionConfig>,
    pub rulesets: HashMap<String, Ruleset>,
    pub jobs: Vec<JobDefinition>,

    /// Absolute engine state directory
    pub home: PathBuf,

    /// File this configuration was read from
    pub source: Option<PathBuf>,

    /// SHA-256 of the file content, used to skip no-op reloads
    pub checksum: String,
}

impl Config {
    /// Locate the config file.
    ///
    /// `explicit` comes from `--config` (which also reads `SLUICE_CONFIG`).
    pub fn discover(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        let cwd = std::env::current_dir().map_err(|source| ConfigError::Io {
            path: PathBuf::from("."),
            source,
        })?;
        find_config_file(&cwd).ok_or(ConfigError::NotFound)
    }

    /// Load a config file, reading variables from the process environment
    pub fn load(path: &Path, environment: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with(path, environment, &|name: &str| std::env::var(name).ok())
    }

    /// Load a config file with an explicit variable lookup
    pub fn load_with(
        path: &Path,
        environment: Option<&str>,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&text, &base_dir(path), environment, lookup)?;
        config.source = Some(path.to_path_buf());
        debug!(path = %path.display(), jobs = config.jobs.len(), "Loaded configuration");
        Ok(config)
    }

    /// Parse a config document; relative paths resolve against `base`
    pub fn from_yaml(
        text: &str,
        base: &Path,
        environment: Option<&str>,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut doc: serde_yaml::Value = parse_yaml(text, "config")?;
        if doc.is_null() {
            doc = serde_yaml::Value::Mapping(Default::default());
        }

        env::apply_environment(&mut doc, environment)?;
        env::substitute(&mut doc, lookup)?;

        let mapping = doc.as_mapping_mut().ok_or_else(|| {
            ConfigError::Invalid(vec!["config root must be a mapping".to_string()])
        })?;
        let defaults = mapping.remove("defaults");
        let inline_jobs = mapping.remove("jobs");
        let jobs_dir = mapping.remove("jobs_dir");

        let mut raw_jobs = match inline_jobs {
            None | Some(serde_yaml::Value::Null) => Vec::new(),
            Some(serde_yaml::Value::Sequence(jobs)) => jobs,
            Some(_) => return Err(ConfigError::Invalid(vec!["'jobs' must be a list".to_string()])),
        };
        if let Some(dir) = jobs_dir.as_ref().and_then(|d| d.as_str()) {
            raw_jobs.extend(load_job_files(&resolve_path(base, dir), lookup)?);
        }

        let mut jobs = Vec::with_capacity(raw_jobs.len());
        for (i, raw) in raw_jobs.into_iter().enumerate() {
            let mut merged = defaults.clone().unwrap_or(serde_yaml::Value::Null);
            env::deep_merge(&mut merged, raw);
            let job: JobDefinition = serde_yaml::from_value(merged).map_err(|source| ConfigError::Parse {
                origin: format!("job #{}", i + 1),
                source,
            })?;
            jobs.push(job);
        }

        let file: ConfigFile = serde_yaml::from_value(doc).map_err(|source| ConfigError::Parse {
            origin: "config".to_string(),
            source,
        })?;

        let home = match lookup("SLUICE_HOME") {
            Some(home) => PathBuf::from(home),
            None => match &file.settings.home {
                Some(home) => resolve_path(base, &home.to_string_lossy()),
                None => default_home(),
            },
        };

        Ok(Self {
            settings: file.settings,
            connections: file.connections,
            rulesets: file.rulesets,
            jobs,
            home,
            source: None,
            checksum: watch::checksum(text.as_bytes()),
        })
    }

    pub fn job(&self, job_id: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    /// Check every cross-reference and bound; all problems are reported at once
    pub fn validate(&self, registry: &Registry) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        problems.extend(self.settings.scheduler.problems());

        for (name, conn) in &self.connections {
            if registry.adapter(&conn.adapter).is_none() {
                problems.push(format!("connection '{}': unknown adapter '{}'", name, conn.adapter));
            }
            for p in conn.problems() {
                problems.push(format!("connection '{}': {}", name, p));
            }
        }

        for (name, ruleset) in &self.rulesets {
            for step in &ruleset.steps {
                match registry.transform(&step.kind) {
                    None => problems.push(format!(
                        "ruleset '{}': step '{}' has unknown kind '{}'",
                        name, step.name, step.kind
                    )),
                    Some(transform) => {
                        if let Err(e) = transform.check_params(&step.params) {
                            problems.push(format!("ruleset '{}': step '{}': {}", name, step.name, e));
                        }
                    }
                }
            }
            let rules = ruleset.validation.post_extract.iter().chain(&ruleset.validation.post_transform);
            for rule in rules {
                if let Some(resolver) = lookup_resolver(rule) {
                    if registry.resolver(resolver).is_none() {
                        problems.push(format!(
                            "ruleset '{}': rule '{}' uses unknown resolver '{}'",
                            name, rule.name, resolver
                        ));
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.id.as_str()) {
                problems.push(format!("job '{}' is defined more than once", job.id));
            }
            for conn in [&job.source.connection, &job.target.connection] {
                if !self.connections.contains_key(conn) {
                    problems.push(format!("job '{}': unknown connection '{}'", job.id, conn));
                }
            }
            if let Some(ruleset) = &job.transform_ruleset {
                if !self.rulesets.contains_key(ruleset) {
                    problems.push(format!("job '{}': unknown ruleset '{}'", job.id, ruleset));
                }
            }
            if let Err(e) = Schedule::parse(&job.schedule) {
                problems.push(format!("job '{}': invalid schedule '{}': {}", job.id, job.schedule, e));
            }
            if job.batch_size == 0 {
                problems.push(format!("job '{}': batch_size must be at least 1", job.id));
            }
            for p in job.retry.problems() {
                problems.push(format!("job '{}': retry: {}", job.id, p));
            }
            if let (Some(column), Some(schema)) = (&job.source.incremental_column, &job.source.schema) {
                if schema.column(column).is_none() {
                    problems.push(format!(
                        "job '{}': incremental column '{}' is not in the source schema",
                        job.id, column
                    ));
                }
            }
        }

        // Duplicates are already reported above
        match DependencyGraph::build(&self.jobs) {
            Err(crate::core::dependency::DependencyError::DuplicateJob(_)) | Ok(_) => {}
            Err(e) => problems.push(e.to_string()),
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

fn lookup_resolver(rule: &Rule) -> Option<&str> {
    match &rule.check {
        Check::Lookup { resolver, .. } => Some(resolver.as_str()),
        _ => None,
    }
}

fn parse_yaml(text: &str, origin: &str) -> Result<serde_yaml::Value, ConfigError> {
    serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
        origin: origin.to_string(),
        source,
    })
}

/// Read every `*.yaml` / `*.yml` file in `dir`; each holds one job or a list of jobs
fn load_job_files(
    dir: &Path,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Vec<serde_yaml::Value>, ConfigError> {
    let mut paths = Vec::new();
    for ext in ["yaml", "yml"] {
        let pattern = dir.join(format!("*.{}", ext)).to_string_lossy().into_owned();
        let matches = glob::glob(&pattern).map_err(|source| ConfigError::Pattern {
            pattern: pattern.clone(),
            source,
        })?;
        paths.extend(matches.filter_map(Result::ok));
    }
    paths.sort();

    let mut jobs = Vec::new();
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut doc = parse_yaml(&text, &path.display().to_string())?;
        env::substitute(&mut doc, lookup)?;
        match doc {
            serde_yaml::Value::Sequence(list) => jobs.extend(list),
            serde_yaml::Value::Null => {}
            job => jobs.push(job),
        }
    }
    Ok(jobs)
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Directory relative paths resolve against: the parent of `.sluice/` for a
/// discovered file, the file's own directory otherwise
fn base_dir(config_path: &Path) -> PathBuf {
    let parent = config_path.parent().unwrap_or(Path::new("."));
    if parent.file_name().is_some_and(|n| n == CONFIG_DIR) {
        parent.parent().unwrap_or(Path::new(".")).to_path_buf()
    } else {
        parent.to_path_buf()
    }
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// `~/.sluice`, or `./.sluice` when no home directory is known
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(CONFIG_DIR))
        .unwrap_or_else(|| PathBuf::from(CONFIG_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
version: "1"
settings:
  home: state
  scheduler:
    max_concurrency: 2
connections:
  crm:
    adapter: jsonl
    options:
      dir: ${DATA_DIR:/tmp/crm}
    pool:
      max: ${CRM_POOL_MAX:4}
  warehouse:
    adapter: memory
rulesets:
  customers:
    validation:
      post_extract:
        - name: id_present
          check: not_null
          columns: [id]
    steps:
      - name: id_to_int
        kind: cast
        params:
          columns:
            id: int
        skip_on_error: true
defaults:
  retry:
    max_attempts: 5
    base_delay_ms: 10
jobs:
  - id: raw_customers
    schedule: "@daily"
    source: { connection: crm, query: customers }
    target: { connection: warehouse, table: raw_customers }
  - id: daily_customers
    schedule: "0 2 * * *"
    depends_on: [raw_customers]
    transform_ruleset: customers
    source: { connection: warehouse, query: raw_customers }
    target: { connection: warehouse, table: dim_customers }
    retry:
      max_attempts: 2
environments:
  prod:
    settings:
      scheduler:
        max_concurrency: 8
"#;

    fn no_vars(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_with_defaults_and_substitution() {
        let base = Path::new("/srv/project");
        let config = Config::from_yaml(CONFIG, base, None, &no_vars).unwrap();

        assert_eq!(config.settings.scheduler.max_concurrency, 2);
        assert_eq!(config.home, PathBuf::from("/srv/project/state"));
        assert_eq!(config.connections["crm"].options["dir"], "/tmp/crm");
        assert_eq!(config.connections["crm"].pool.max, 4);

        let raw = config.job("raw_customers").unwrap();
        assert_eq!(raw.retry.max_attempts, 5);
        assert_eq!(raw.retry.base_delay_ms, 10);

        // Job fields win over defaults, untouched defaults still apply
        let daily = config.job("daily_customers").unwrap();
        assert_eq!(daily.retry.max_attempts, 2);
        assert_eq!(daily.retry.base_delay_ms, 10);
        assert!(daily.retry.is_retryable(ErrorKind::Load));

        assert!(config.validate(&Registry::with_builtins()).is_ok());
    }

    #[test]
    fn test_environment_overlay_and_vars() {
        let lookup = |name: &str| match name {
            "DATA_DIR" => Some("/data/crm".to_string()),
            "SLUICE_HOME" => Some("/var/lib/sluice".to_string()),
            _ => None,
        };
        let config = Config::from_yaml(CONFIG, Path::new("/srv"), Some("prod"), &lookup).unwrap();

        assert_eq!(config.settings.scheduler.max_concurrency, 8);
        assert_eq!(config.connections["crm"].options["dir"], "/data/crm");
        assert_eq!(config.home, PathBuf::from("/var/lib/sluice"));

        let err = Config::from_yaml(CONFIG, Path::new("/srv"), Some("staging"), &lookup).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEnvironment(ref e) if e == "staging"));
    }

    #[test]
    fn test_missing_variable_is_an_error() {
        let text = "connections:\n  a:\n    adapter: ${ADAPTER}\n";
        let err = Config::from_yaml(text, Path::new("."), None, &no_vars).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(ref v) if v == "ADAPTER"));
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let text = r#"
connections:
  src: { adapter: oracle }
  dst: { adapter: memory, pool: { min: 5, max: 2 } }
rulesets:
  r:
    steps:
      - { name: s, kind: explode }
jobs:
  - id: a
    schedule: "every tuesday"
    depends_on: [b]
    transform_ruleset: missing
    source: { connection: src, query: q }
    target: { connection: nowhere, table: t }
    retry: { max_attempts: 0, backoff_factor: 0.5 }
  - id: b
    schedule: "@daily"
    depends_on: [a]
    source: { connection: src, query: q }
    target: { connection: dst, table: t }
  - id: c
    schedule: "@daily"
    source:
      connection: dst
      query: events
      incremental: updated_at
      schema: [{ name: id, type: int }]
    target: { connection: dst, table: t }
"#;
        let config = Config::from_yaml(text, Path::new("."), None, &no_vars).unwrap();
        let Err(ConfigError::Invalid(problems)) = config.validate(&Registry::with_builtins()) else {
            panic!("expected validation failure");
        };
        let all = problems.join("\n");

        assert!(all.contains("unknown adapter 'oracle'"));
        assert!(all.contains("pool.min (5) exceeds pool.max (2)"));
        assert!(all.contains("unknown kind 'explode'"));
        assert!(all.contains("unknown connection 'nowhere'"));
        assert!(all.contains("unknown ruleset 'missing'"));
        assert!(all.contains("max_attempts must be at least 1"));
        assert!(all.contains("backoff_factor"));
        assert!(all.contains("cycle"));
        assert!(all.contains("incremental column 'updated_at' is not in the source schema"));
        assert!(problems.iter().any(|p| p.starts_with("job 'a'") && p.contains("schedule")));
    }

    #[test]
    fn test_discover_and_jobs_dir() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::create_dir_all(dir.path().join("jobs")).unwrap();
        std::fs::write(
            config_dir.join(CONFIG_FILE),
            "connections:\n  m: { adapter: memory }\njobs_dir: jobs\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("jobs/orders.yaml"),
            "id: orders\nschedule: '@hourly'\nsource: { connection: m, query: q }\ntarget: { connection: m, table: t }\n",
        )
        .unwrap();

        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, config_dir.join(CONFIG_FILE));

        let config = Config::load_with(&found, None, &no_vars).unwrap();
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].id, "orders");
        assert_eq!(config.source.as_deref(), Some(found.as_path()));
        assert_eq!(config.checksum.len(), 64);
    }
}
