//! Engine configuration
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML file
//! (`cadence.toml`, or the path in `CADENCE_CONFIG`), then `CADENCE_*`
//! environment variables with `__` as the section separator, e.g.
//! `CADENCE_QUEUES__NOTIFICATIONS__CONCURRENCY=8`.
//!
//! The defaults are a full source of their own, so the file and the
//! environment may override single fields of a built-in queue.

use anyhow::{bail, Context, Result};
use cadence_core::domain::{
    validate_queue_name, KeepJobs, QueueOptions, RetentionPolicy, WorkerConfig,
};
use cadence_infra_sqlite::ConnectRetry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const CHECK_SOURCES_QUEUE: &str = "check-sources";
pub const NOTIFICATIONS_QUEUE: &str = "notifications";

const DEFAULT_CONFIG_FILE: &str = "cadence";
const ENV_PREFIX: &str = "CADENCE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default = "default_queues")]
    pub queues: BTreeMap<String, QueueConfig>,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Source ids the scheduler enqueues a check for on every cycle
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path (`~` expanded) or `:memory:`
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    #[serde(default = "default_connect_base_delay_ms")]
    pub connect_base_delay_ms: u64,

    #[serde(default = "default_connect_max_delay_ms")]
    pub connect_max_delay_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            connect_attempts: default_connect_attempts(),
            connect_base_delay_ms: default_connect_base_delay_ms(),
            connect_max_delay_ms: default_connect_max_delay_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }

    /// Database file path with `~` expanded (None for in-memory)
    pub fn file_path(&self) -> Option<PathBuf> {
        if self.is_in_memory() {
            None
        } else {
            Some(PathBuf::from(shellexpand::tilde(&self.path).into_owned()))
        }
    }

    pub fn url(&self) -> String {
        match self.file_path() {
            Some(path) => format!("sqlite://{}", path.display()),
            None => "sqlite::memory:".to_string(),
        }
    }

    pub fn connect_retry(&self) -> ConnectRetry {
        ConnectRetry {
            max_attempts: self.connect_attempts,
            base_delay: Duration::from_millis(self.connect_base_delay_ms),
            max_delay: Duration::from_millis(self.connect_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Directive used when `RUST_LOG` is unset (default `cadence=info`)
    #[serde(default)]
    pub filter: Option<String>,

    /// Directory for daily-rolling JSON log files
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_scheduler_interval_secs")]
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_scheduler_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePreset {
    Critical,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max: u32,
    pub window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub completed_count: u32,
    pub completed_age_secs: u64,
    pub failed_count: u32,
    pub failed_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub preset: QueuePreset,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Overrides the preset's retention caps
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
}

impl QueueConfig {
    pub fn queue_options(&self) -> QueueOptions {
        let options = match self.preset {
            QueuePreset::Critical => QueueOptions::critical(),
            QueuePreset::BestEffort => QueueOptions::best_effort(),
        };
        match self.retention {
            Some(r) => options.with_retention(RetentionPolicy {
                completed: KeepJobs::new(
                    r.completed_count,
                    Duration::from_secs(r.completed_age_secs),
                ),
                failed: KeepJobs::new(r.failed_count, Duration::from_secs(r.failed_age_secs)),
            }),
            None => options,
        }
    }

    pub fn worker_config(&self, queue: &str) -> WorkerConfig {
        let mut config = WorkerConfig::new(queue, self.concurrency)
            .with_lease_duration(Duration::from_millis(self.lease_ms));
        if let Some(limit) = self.rate_limit {
            config = config.with_rate_limit(limit.max, Duration::from_millis(limit.window_ms));
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config = config.with_handler_timeout(Duration::from_millis(timeout_ms));
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_interval_secs: default_retention_interval_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
        }
    }
}

impl MaintenanceConfig {
    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Abort handlers still running this long after the first signal
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            log: LogConfig::default(),
            scheduler: SchedulerConfig::default(),
            queues: default_queues(),
            maintenance: MaintenanceConfig::default(),
            shutdown: ShutdownConfig::default(),
            sources: Vec::new(),
        }
    }
}

fn default_db_path() -> String {
    "~/.cadence/jobs.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_base_delay_ms() -> u64 {
    200
}

fn default_connect_max_delay_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

fn default_scheduler_interval_secs() -> u64 {
    300
}

fn default_concurrency() -> usize {
    5
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_retention_interval_secs() -> u64 {
    300
}

fn default_reaper_interval_secs() -> u64 {
    15
}

fn default_queues() -> BTreeMap<String, QueueConfig> {
    let mut queues = BTreeMap::new();
    queues.insert(
        CHECK_SOURCES_QUEUE.to_string(),
        QueueConfig {
            preset: QueuePreset::BestEffort,
            concurrency: 5,
            rate_limit: Some(RateLimitConfig {
                max: 10,
                window_ms: 1_000,
            }),
            timeout_ms: Some(60_000),
            lease_ms: default_lease_ms(),
            retention: None,
        },
    );
    queues.insert(
        NOTIFICATIONS_QUEUE.to_string(),
        QueueConfig {
            preset: QueuePreset::Critical,
            concurrency: 5,
            rate_limit: None,
            timeout_ms: Some(30_000),
            lease_ms: default_lease_ms(),
            retention: None,
        },
    );
    queues
}

impl EngineConfig {
    /// Load defaults, then the config file (optional), then the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::with_name(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Self::load_from(file, Self::environment())
    }

    /// `CADENCE_SCHEDULER__INTERVAL_SECS=60`, `CADENCE_SOURCES=feed-1,feed-2`
    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("sources")
    }

    fn load_from<S>(file: S, env: config::Environment) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let defaults = config::Config::try_from(&EngineConfig::default())
            .context("failed to encode built-in defaults")?;

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(env)
            .build()
            .context("failed to read configuration")?;

        settings
            .try_deserialize()
            .context("invalid configuration")
    }

    /// Reject configurations the engine cannot run
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            bail!("at least one queue must be configured");
        }
        for (name, queue) in &self.queues {
            validate_queue_name(name).with_context(|| format!("queue {}", name))?;
            queue
                .worker_config(name)
                .validate()
                .with_context(|| format!("queue {}", name))?;
        }
        if self.scheduler.enabled && self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be > 0");
        }
        if self.maintenance.reaper_interval_secs == 0
            || self.maintenance.retention_interval_secs == 0
        {
            bail!("maintenance intervals must be > 0");
        }
        Ok(())
    }

    pub fn retention_policies(&self) -> Vec<(String, RetentionPolicy)> {
        self.queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.queue_options().retention))
            .collect()
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.shutdown.drain_timeout_secs.map(Duration::from_secs)
    }
}
