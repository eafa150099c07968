//! Configuration management

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::model::StatType;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "text" or "gcp" (structured Cloud Logging)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Where counters, snapshots and job locks live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Process-local; only sees counters written through the same process
    #[default]
    Memory,
    /// Shared Redis instance fed by the event-recording path
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackend,
    /// Required when `backend = "redis"`
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_redis_timeout_ms")]
    pub redis_timeout_ms: u64,
    /// Lifetime of cached statistics snapshots
    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,
}

fn default_redis_timeout_ms() -> u64 {
    500
}

fn default_snapshot_ttl_secs() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::default(),
            redis_url: None,
            redis_timeout_ms: default_redis_timeout_ms(),
            snapshot_ttl_secs: default_snapshot_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
    /// Guard each batch run with a cache lock so overlapping runs skip instead of repeating work
    #[serde(default = "default_true")]
    pub use_lock: bool,
    #[serde(default = "default_true")]
    pub run_on_start: bool,
    #[serde(default = "default_tracked_stat_types")]
    pub tracked_stat_types: Vec<StatType>,
}

fn default_interval_secs() -> u64 {
    600
}

fn default_lock_ttl_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_tracked_stat_types() -> Vec<StatType> {
    vec![StatType::Questionnaire, StatType::Testee, StatType::Screening]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            lock_ttl_secs: default_lock_ttl_secs(),
            use_lock: true,
            run_on_start: true,
            tracked_stat_types: default_tracked_stat_types(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("ASSESSMENT_STATS").separator("__"));

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate database config
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("database.max_connections must be at least 1");
        }

        // Validate cache and scheduler timings
        if self.cache.snapshot_ttl_secs == 0 {
            anyhow::bail!("cache.snapshot_ttl_secs must be positive");
        }
        if self.cache.backend == CacheBackend::Redis {
            if self.cache.redis_url.as_deref().map_or(true, str::is_empty) {
                anyhow::bail!("cache.redis_url is required when cache.backend is \"redis\"");
            }
            if self.cache.redis_timeout_ms == 0 {
                anyhow::bail!("cache.redis_timeout_ms must be positive");
            }
        }
        if self.scheduler.interval_secs == 0 {
            anyhow::bail!("scheduler.interval_secs must be positive");
        }
        if self.scheduler.use_lock && self.scheduler.lock_ttl_secs == 0 {
            anyhow::bail!("scheduler.lock_ttl_secs must be positive when locking is enabled");
        }
        if let Some(t) = self
            .scheduler
            .tracked_stat_types
            .iter()
            .find(|t| !t.is_counter_backed())
        {
            anyhow::bail!("Stat type '{}' is not counter-backed and cannot be tracked", t);
        }

        // Validate logging
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }
        let valid_formats = ["text", "gcp"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!("Invalid logging format '{}'. Must be one of: {:?}", self.logging.format, valid_formats);
        }

        Ok(())
    }
}
