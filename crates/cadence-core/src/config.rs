use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;
pub const MAX_POLL_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_EXPAND_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DISPATCH_BUFFER: usize = 256;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_LOG_FILTER: &str = "cadence_daemon=info,cadence_scheduler=info";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long SQLite waits on a locked database before failing a statement.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Poller and expansion cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds to sleep between polls of the due-jobs table (1–30).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Maximum rows returned by a single due-jobs fetch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between recurring-job expansion passes.
    #[serde(default = "default_expand_interval_secs")]
    pub expand_interval_secs: u64,
    /// Capacity of the in-process hand-off channel.
    #[serde(default = "default_dispatch_buffer")]
    pub dispatch_buffer: usize,
    /// Identifier written to `claimed_by`. A random UUID is used when unset.
    #[serde(default)]
    pub poller_id: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            expand_interval_secs: DEFAULT_EXPAND_INTERVAL_SECS,
            dispatch_buffer: DEFAULT_DISPATCH_BUFFER,
            poller_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_expand_interval_secs() -> u64 {
    DEFAULT_EXPAND_INTERVAL_SECS
}
fn default_dispatch_buffer() -> usize {
    DEFAULT_DISPATCH_BUFFER
}
fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__BATCH_SIZE=500`. A missing file is not an error;
    /// every field has a default.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CoreError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduler;
        if !(MIN_POLL_INTERVAL_SECS..=MAX_POLL_INTERVAL_SECS).contains(&s.poll_interval_secs) {
            return Err(CoreError::Config(format!(
                "scheduler.poll_interval_secs must be between {MIN_POLL_INTERVAL_SECS} and {MAX_POLL_INTERVAL_SECS}, got {}",
                s.poll_interval_secs
            )));
        }
        if s.batch_size == 0 {
            return Err(CoreError::Config(
                "scheduler.batch_size must be greater than zero".to_string(),
            ));
        }
        if s.expand_interval_secs == 0 {
            return Err(CoreError::Config(
                "scheduler.expand_interval_secs must be greater than zero".to_string(),
            ));
        }
        if s.dispatch_buffer == 0 {
            return Err(CoreError::Config(
                "scheduler.dispatch_buffer must be greater than zero".to_string(),
            ));
        }
        if self.database.path.trim().is_empty() {
            return Err(CoreError::Config("database.path must not be empty".to_string()));
        }
        Ok(())
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CadenceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.scheduler.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
        assert!(config.database.path.ends_with(".cadence/cadence.db"));
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cadence.toml");
        std::fs::write(
            &path,
            "[database]\npath = \"/tmp/jobs.db\"\n\n[scheduler]\nbatch_size = 50\npoll_interval_secs = 2\n",
        )
        .expect("write config");

        let config = CadenceConfig::load(path.to_str()).expect("load");
        assert_eq!(config.database.path, "/tmp/jobs.db");
        assert_eq!(config.scheduler.batch_size, 50);
        assert_eq!(config.scheduler.poll_interval_secs, 2);
        // untouched sections keep their defaults
        assert_eq!(config.scheduler.expand_interval_secs, DEFAULT_EXPAND_INTERVAL_SECS);
        assert_eq!(config.logging.filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        let config = CadenceConfig::load(path.to_str()).expect("load");
        assert_eq!(config.scheduler.dispatch_buffer, DEFAULT_DISPATCH_BUFFER);
    }

    #[test]
    fn validate_rejects_poll_interval_out_of_range() {
        let mut config = CadenceConfig::default();
        config.scheduler.poll_interval_secs = 0;
        assert!(config.validate().is_err());
        config.scheduler.poll_interval_secs = 31;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let mut config = CadenceConfig::default();
        config.scheduler.batch_size = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
