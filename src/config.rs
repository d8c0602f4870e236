//! Central application configuration.
//! Loads environment variables (optionally from a `.env` file) into an
//! owned `AppConfig` that is passed by value to whoever needs it; there
//! is no process-wide configuration singleton, so several independent
//! searches can coexist in one process.
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use evo_core::SchedulerOptions;

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root directory for structure working directories.
    pub working_dir: PathBuf,
    /// Remote connection pool size (bounds concurrent remote sessions).
    pub pool_size: usize,
    pub scheduler: SchedulerOptions,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = SchedulerOptions::default();
        let scheduler = SchedulerOptions {
            poll_interval_ms: parse_env("EVOFLOW_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            running_job_limit: parse_env("EVOFLOW_RUNNING_JOB_LIMIT", defaults.running_job_limit),
            fail_limit: parse_env("EVOFLOW_FAIL_LIMIT", defaults.fail_limit),
            comm_retry_limit: parse_env("EVOFLOW_COMM_RETRY_LIMIT", defaults.comm_retry_limit),
            comm_backoff_ms: parse_env("EVOFLOW_COMM_BACKOFF_MS", defaults.comm_backoff_ms),
            ..defaults
        };
        AppConfig {
            working_dir: env::var("EVOFLOW_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("evoflow-work")),
            pool_size: parse_env("EVOFLOW_POOL_SIZE", 5),
            scheduler,
        }
    }
}
