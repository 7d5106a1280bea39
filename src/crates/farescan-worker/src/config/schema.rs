//! Configuration schema for the fare search worker

use crate::error::{Result, WorkerError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WorkerConfig {
    /// Execution settings
    #[serde(default)]
    pub worker: WorkerSettings,

    /// Backoff for transient search failures
    #[serde(default)]
    pub retry: RetrySettings,

    /// Lease, heartbeat and recovery timing
    #[serde(default)]
    pub lease: LeaseSettings,

    /// Job store location and polling
    #[serde(default)]
    pub store: StoreSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Execution settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSettings {
    /// Lease owner name; generated when absent
    pub worker_id: Option<String>,

    /// Process-wide cap on concurrently executing search units
    pub concurrency: usize,

    /// Committed units between checkpoint writes
    pub checkpoint_interval: u64,

    /// Wall-clock bound on a single search attempt, in seconds
    pub unit_timeout_secs: u64,

    /// Searches allowed per `time_window_secs`
    pub rate_limit: u32,

    /// Rate limit window in seconds
    pub time_window_secs: u64,

    /// Capacity of the unit outcome channel, and the furthest dispatch may
    /// run ahead of the committed prefix
    pub result_buffer: usize,

    /// Consecutive failed checkpoint writes before a job fails
    pub checkpoint_write_attempts: u32,

    /// Pause between checkpoint write retries, in milliseconds
    pub store_retry_delay_ms: u64,

    /// Consecutive dispatcher store errors before logging at error level
    pub infra_error_threshold: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            worker_id: None,
            concurrency: 3,
            checkpoint_interval: 100,
            unit_timeout_secs: 120,
            rate_limit: 60,
            time_window_secs: 60,
            result_buffer: 64,
            checkpoint_write_attempts: 3,
            store_retry_delay_ms: 1000,
            infra_error_threshold: 5,
        }
    }
}

/// Backoff for transient search failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 5_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Lease, heartbeat and recovery timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeaseSettings {
    pub ttl_secs: u64,
    /// How often a running job's lease is renewed
    pub renew_interval_secs: u64,
    /// How often orphaned jobs are looked for
    pub reconcile_interval_secs: u64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            renew_interval_secs: 20,
            reconcile_interval_secs: 30,
        }
    }
}

impl LeaseSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// Checkpoint file encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreFormat {
    Bincode,
    Json,
}

/// Job store location and polling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    /// Root directory of the file job store
    pub path: PathBuf,
    pub format: StoreFormat,
    /// How often the store-backed queue looks for ready jobs, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".farescan/jobs"),
            format: StoreFormat::Bincode,
            poll_interval_ms: 1000,
        }
    }
}

/// Log output style
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Pretty,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error", or a full filter directive
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl WorkerConfig {
    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, keyed by the environment variable names
    /// `WORKER_CONCURRENCY`, `MAX_RETRIES`, `CHECKPOINT_INTERVAL`,
    /// `WORKER_RATE_LIMIT`, `WORKER_TIME_WINDOW`, `WORKER_ID` and `LOG_LEVEL`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("WORKER_CONCURRENCY") {
            self.worker.concurrency = parse_var("WORKER_CONCURRENCY", &v)?;
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            self.retry.max_retries = parse_var("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("CHECKPOINT_INTERVAL") {
            self.worker.checkpoint_interval = parse_var("CHECKPOINT_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("WORKER_RATE_LIMIT") {
            self.worker.rate_limit = parse_var("WORKER_RATE_LIMIT", &v)?;
        }
        if let Some(v) = lookup("WORKER_TIME_WINDOW") {
            self.worker.time_window_secs = parse_var("WORKER_TIME_WINDOW", &v)?;
        }
        if let Some(v) = lookup("WORKER_ID") {
            self.worker.worker_id = Some(v);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v.to_ascii_lowercase();
        }
        Ok(())
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<()> {
        let w = &self.worker;
        if w.concurrency == 0 {
            return Err(invalid("worker.concurrency must be at least 1"));
        }
        if w.checkpoint_interval == 0 {
            return Err(invalid("worker.checkpoint_interval must be at least 1"));
        }
        if w.rate_limit == 0 || w.time_window_secs == 0 {
            return Err(invalid("worker.rate_limit and worker.time_window_secs must be positive"));
        }
        if w.unit_timeout_secs == 0 {
            return Err(invalid("worker.unit_timeout_secs must be positive"));
        }
        if w.result_buffer == 0 {
            return Err(invalid("worker.result_buffer must be at least 1"));
        }
        if w.checkpoint_write_attempts == 0 {
            return Err(invalid("worker.checkpoint_write_attempts must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be at least 1.0"));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.initial_delay_ms exceeds retry.max_delay_ms"));
        }
        if self.lease.ttl_secs == 0 || self.lease.renew_interval_secs == 0 {
            return Err(invalid("lease.ttl_secs and lease.renew_interval_secs must be positive"));
        }
        if self.lease.renew_interval_secs >= self.lease.ttl_secs {
            return Err(invalid("lease.renew_interval_secs must be shorter than lease.ttl_secs"));
        }
        if self.lease.reconcile_interval_secs == 0 || self.store.poll_interval_ms == 0 {
            return Err(invalid("lease.reconcile_interval_secs and store.poll_interval_ms must be positive"));
        }
        Ok(())
    }

    /// Configured worker id, or a fresh one
    pub fn worker_id(&self) -> String {
        self.worker
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("farescan-{}", uuid::Uuid::new_v4().simple()))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| WorkerError::Config(format!("{}={:?}: {}", name, value, e)))
}

fn invalid(msg: &str) -> WorkerError {
    WorkerError::Config(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.worker.concurrency, 3);
        assert_eq!(config.worker.checkpoint_interval, 100);
        assert_eq!(config.worker.rate_limit, 60);
        assert_eq!(config.worker.time_window_secs, 60);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 5_000);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("WORKER_CONCURRENCY", "8"),
            ("MAX_RETRIES", "5"),
            ("CHECKPOINT_INTERVAL", " 25 "),
            ("LOG_LEVEL", "DEBUG"),
        ]
        .into_iter()
        .collect();

        let mut config = WorkerConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.worker.checkpoint_interval, 25);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.worker.rate_limit, 60);
    }

    #[test]
    fn test_unparsable_override_is_an_error() {
        let mut config = WorkerConfig::default();
        let err = config
            .apply_overrides(|name| (name == "WORKER_RATE_LIMIT").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("WORKER_RATE_LIMIT"));
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let mut config = WorkerConfig::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.worker.checkpoint_interval = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.worker.time_window_secs = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.lease.renew_interval_secs = config.lease.ttl_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: WorkerConfig = toml::from_str(
            r#"
[worker]
concurrency = 6

[store]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.worker.concurrency, 6);
        assert_eq!(config.worker.checkpoint_interval, 100);
        assert_eq!(config.store.format, StoreFormat::Json);
        assert_eq!(config.logging.format, LogFormat::Compact);
    }
}
