//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on unparseable values. Every knob has
//! a default so a bare `courier serve` works out of the box. In local dev,
//! call `dotenvy::dotenv().ok()` before `from_env`.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the task store file.
    pub queue_file: PathBuf,
    /// Default retry budget for new tasks.
    pub max_retries: u32,
    /// Scheduler tick period.
    pub poll_interval: Duration,
    /// Scheduler concurrency ceiling.
    pub max_concurrent: usize,
    /// Cooperative per-task timeout.
    pub task_timeout: Duration,
    /// Bound on graceful-shutdown draining.
    pub shutdown_timeout: Duration,
    /// When false, `serve` starts without a scheduler loop.
    pub scheduler_enabled: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            queue_file: std::env::var("COURIER_QUEUE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("courier-queue.json")),
            max_retries: parsed_var("COURIER_MAX_RETRIES", 3)?,
            poll_interval: Duration::from_millis(parsed_var("COURIER_POLL_INTERVAL_MS", 5_000)?),
            max_concurrent: parsed_var("COURIER_MAX_CONCURRENT", 2)?,
            task_timeout: Duration::from_millis(parsed_var("COURIER_TASK_TIMEOUT_MS", 300_000)?),
            shutdown_timeout: Duration::from_millis(parsed_var(
                "COURIER_SHUTDOWN_TIMEOUT_MS",
                30_000,
            )?),
            scheduler_enabled: parsed_var("COURIER_SCHEDULER_ENABLED", true)?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: self.poll_interval,
            max_concurrent: self.max_concurrent,
            task_timeout: self.task_timeout,
            graceful_shutdown_timeout: self.shutdown_timeout,
            enabled: self.scheduler_enabled,
        }
    }
}

/// Read an env var, falling back to `default` when unset, failing on
/// values that don't parse.
fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("bad value for {name}: {e}"))),
        Err(_) => Ok(default),
    }
}
