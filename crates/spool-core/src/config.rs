//! Queue configuration.
//!
//! Loaded from TOML, every key optional. `SPOOL_*` environment variables
//! override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest accepted stuck-task age (one week).
const MAX_STUCK_TASK_AGE_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv { var: String, value: String },
}

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of concurrent worker slots in this process.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Sleep between polls when no pending task was found.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A processing task idle for longer than this is considered abandoned.
    #[serde(default = "default_stuck_task_age_secs")]
    pub stuck_task_age_secs: u64,

    /// How often the reaper scans for abandoned tasks.
    #[serde(default = "default_recovery_interval_secs")]
    pub recovery_interval_secs: u64,

    /// Claims allowed before the reaper fails a task instead of requeueing it
    /// (0 = unlimited).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-execution timeout (0 = none).
    #[serde(default)]
    pub execution_timeout_secs: u64,

    /// Tries for writing a task's final status.
    #[serde(default = "default_report_attempts")]
    pub report_attempts: u32,

    /// Requeue every processing task once at startup. Only safe when this is
    /// the sole worker process.
    #[serde(default)]
    pub recover_on_start: bool,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backoff for store errors while polling and for status reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_worker_count() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_stuck_task_age_secs() -> u64 {
    1800 // 30 minutes
}

fn default_recovery_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_attempts() -> u32 {
    5
}

fn default_report_attempts() -> u32 {
    3
}

fn default_database_path() -> PathBuf {
    PathBuf::from("spool.db")
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            stuck_task_age_secs: default_stuck_task_age_secs(),
            recovery_interval_secs: default_recovery_interval_secs(),
            max_attempts: default_max_attempts(),
            execution_timeout_secs: 0,
            report_attempts: default_report_attempts(),
            recover_on_start: false,
            database_path: default_database_path(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl QueueConfig {
    /// Read a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `SPOOL_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any variable source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "SPOOL_WORKER_COUNT", &mut self.worker_count)?;
        override_parsed(&lookup, "SPOOL_POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        override_parsed(&lookup, "SPOOL_STUCK_TASK_AGE_SECS", &mut self.stuck_task_age_secs)?;
        override_parsed(
            &lookup,
            "SPOOL_RECOVERY_INTERVAL_SECS",
            &mut self.recovery_interval_secs,
        )?;
        override_parsed(&lookup, "SPOOL_MAX_ATTEMPTS", &mut self.max_attempts)?;
        override_parsed(
            &lookup,
            "SPOOL_EXECUTION_TIMEOUT_SECS",
            &mut self.execution_timeout_secs,
        )?;
        override_parsed(&lookup, "SPOOL_REPORT_ATTEMPTS", &mut self.report_attempts)?;
        override_parsed(&lookup, "SPOOL_RECOVER_ON_START", &mut self.recover_on_start)?;
        if let Some(path) = lookup("SPOOL_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=99).contains(&self.worker_count) {
            return Err(ConfigError::Invalid(format!(
                "worker_count must be between 1 and 99, got {}",
                self.worker_count
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be > 0".into()));
        }
        if self.stuck_task_age_secs == 0 || self.stuck_task_age_secs > MAX_STUCK_TASK_AGE_SECS {
            return Err(ConfigError::Invalid(format!(
                "stuck_task_age_secs must be between 1 and {MAX_STUCK_TASK_AGE_SECS}, got {}",
                self.stuck_task_age_secs
            )));
        }
        if self.recovery_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "recovery_interval_secs must be > 0".into(),
            ));
        }
        if self.report_attempts == 0 {
            return Err(ConfigError::Invalid("report_attempts must be >= 1".into()));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stuck_task_age(&self) -> Duration {
        Duration::from_secs(self.stuck_task_age_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }

    /// `None` means unlimited.
    pub fn max_attempts(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }

    /// `None` means no timeout.
    pub fn execution_timeout(&self) -> Option<Duration> {
        (self.execution_timeout_secs > 0).then(|| Duration::from_secs(self.execution_timeout_secs))
    }
}

fn override_parsed<F, T>(lookup: &F, var: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(value) = lookup(var) {
        *slot = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        })?;
    }
    Ok(())
}
