//! Scheduler configuration.
//!
//! Defaults match the production retry settings (1 s base delay, two
//! attempts). Every field can be overridden from the environment:
//!
//! | variable | field |
//! |---|---|
//! | `FINMAN_TICK_INTERVAL_SECS` | `tick_interval` |
//! | `FINMAN_EXECUTOR_TIMEOUT_MS` | `executor_timeout` |
//! | `FINMAN_RETRY_BASE_DELAY_MS` | `retry.base_delay` |
//! | `FINMAN_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `FINMAN_RETRY_MAX_DELAY_MS` | `retry.max_delay` |
//! | `FINMAN_CLAIM_TIMEOUT_SECS` | `claim_timeout` |
//! | `FINMAN_JOB_RETENTION_SECS` | `job_retention` |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::jobs::RetryPolicy;

pub const TICK_INTERVAL_SECS: &str = "FINMAN_TICK_INTERVAL_SECS";
pub const EXECUTOR_TIMEOUT_MS: &str = "FINMAN_EXECUTOR_TIMEOUT_MS";
pub const RETRY_BASE_DELAY_MS: &str = "FINMAN_RETRY_BASE_DELAY_MS";
pub const RETRY_MAX_ATTEMPTS: &str = "FINMAN_RETRY_MAX_ATTEMPTS";
pub const RETRY_MAX_DELAY_MS: &str = "FINMAN_RETRY_MAX_DELAY_MS";
pub const CLAIM_TIMEOUT_SECS: &str = "FINMAN_CLAIM_TIMEOUT_SECS";
pub const JOB_RETENTION_SECS: &str = "FINMAN_JOB_RETENTION_SECS";
pub const DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be an unsigned integer (got '{value}')")]
    NotANumber { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name for logging
    pub name: String,
    /// How often the runner calls `tick`
    pub tick_interval: Duration,
    /// Upper bound for a single executor call
    pub executor_timeout: Duration,
    pub retry: RetryPolicy,
    /// A job still `Running` this long after it was claimed lost its outcome
    /// and is handed back for another run
    pub claim_timeout: Duration,
    /// How long succeeded jobs are kept before `prune` may drop them
    pub job_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "recurring-scheduler".to_string(),
            tick_interval: Duration::from_secs(60),
            executor_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            claim_timeout: Duration::from_secs(300),
            job_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = parse_positive(&lookup, TICK_INTERVAL_SECS)? {
            config.tick_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_positive(&lookup, EXECUTOR_TIMEOUT_MS)? {
            config.executor_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_positive(&lookup, RETRY_BASE_DELAY_MS)? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(n) = parse_positive(&lookup, RETRY_MAX_ATTEMPTS)? {
            config.retry.max_attempts = u32::try_from(n).map_err(|_| ConfigError::NotANumber {
                var: RETRY_MAX_ATTEMPTS,
                value: n.to_string(),
            })?;
        }
        if let Some(ms) = parse_positive(&lookup, RETRY_MAX_DELAY_MS)? {
            config.retry.max_delay = Duration::from_millis(ms);
        }

        if let Some(secs) = parse_positive(&lookup, CLAIM_TIMEOUT_SECS)? {
            config.claim_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_positive(&lookup, JOB_RETENTION_SECS)? {
            config.job_retention = Duration::from_secs(secs);
        }

        if config.claim_timeout <= config.executor_timeout {
            warn!(
                claim_timeout_ms = config.claim_timeout.as_millis() as u64,
                executor_timeout_ms = config.executor_timeout.as_millis() as u64,
                "claim timeout does not exceed the executor timeout; slow attempts may run twice"
            );
        }
        if config.retry.max_delay < config.retry.base_delay {
            warn!(
                base_delay_ms = config.retry.base_delay.as_millis() as u64,
                max_delay_ms = config.retry.max_delay.as_millis() as u64,
                "retry max delay is below the base delay; every retry will wait max delay"
            );
        }

        Ok(config)
    }
}

/// Process-level configuration for the worker binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Postgres connection string; `None` selects the in-memory stores.
    pub database_url: Option<String>,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup(DATABASE_URL).filter(|url| !url.trim().is_empty());
        Ok(Self {
            database_url,
            scheduler: SchedulerConfig::from_lookup(lookup)?,
        })
    }
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let value: u64 = raw.trim().parse().map_err(|_| ConfigError::NotANumber {
        var,
        value: raw.clone(),
    })?;
    if value == 0 {
        return Err(ConfigError::Zero { var });
    }
    Ok(Some(value))
}
