//! Configuration types.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;
use crate::exec::shell::DEFAULT_TIMEOUT;
use crate::job::RetryPolicy;

pub const ENV_MAX_RETRIES: &str = "JOBQUEUE_MAX_RETRIES";
pub const ENV_BACKOFF_BASE: &str = "JOBQUEUE_BACKOFF_BASE";
pub const ENV_WORKER_COUNT: &str = "JOBQUEUE_WORKER_COUNT";
pub const ENV_DATA_DIR: &str = "JOBQUEUE_DATA_DIR";

const DB_FILE: &str = "jobs.db";
const PID_FILE: &str = "workers.pid";
const LOG_DIR: &str = "logs";

/// Queue configuration, shared by the CLI and every worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueConfig {
    /// Retry budget for jobs enqueued without an explicit one.
    pub max_retries: u32,
    /// Base of the exponential backoff (`base ^ attempts` seconds).
    pub backoff_base: u32,
    /// Workers launched by `worker start` without `--count`.
    pub worker_count: usize,
    /// Root of the persisted layout (database, PID file, logs).
    pub data_dir: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2,
            worker_count: 1,
            data_dir: default_data_dir(),
        }
    }
}

impl QueueConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            max_retries: parse_var(&lookup, ENV_MAX_RETRIES)?.unwrap_or(defaults.max_retries),
            backoff_base: parse_var(&lookup, ENV_BACKOFF_BASE)?.unwrap_or(defaults.backoff_base),
            worker_count: parse_var(&lookup, ENV_WORKER_COUNT)?.unwrap_or(defaults.worker_count),
            data_dir: match lookup(ENV_DATA_DIR) {
                Some(dir) if dir.trim().is_empty() => {
                    return Err(ConfigError::InvalidValue {
                        key: ENV_DATA_DIR.to_string(),
                        message: "must not be empty".to_string(),
                    });
                }
                Some(dir) => PathBuf::from(dir),
                None => defaults.data_dir,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_base == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_BACKOFF_BASE.to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidValue {
                key: ENV_WORKER_COUNT.to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.data_dir.join(PID_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join(LOG_DIR)
    }

    /// Create the data and log directories if missing.
    pub fn ensure_dirs(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

/// Per-worker loop tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when nothing is claimable.
    pub idle_interval: Duration,
    /// Maximum run time for a single job's command.
    pub job_timeout: Duration,
    /// Pause after a store error before the next cycle.
    pub error_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(1),
            job_timeout: DEFAULT_TIMEOUT,
            error_pause: Duration::from_secs(1),
        }
    }
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".jobqueue").join("data")
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
