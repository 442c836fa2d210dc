use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cron::{CronIntervals, DEFAULT_FAILED_TASK_RETENTION};
use crate::db::DbConfig;

/// Default compute API endpoint.
pub const DEFAULT_COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Run migrations on startup.
    pub dev_mode: bool,
    pub database: DbConfig,
    pub compute_endpoint: String,
    /// Bearer token for the compute and bot fleet APIs.
    pub access_token: Option<String>,
    pub cron_interval: Duration,
    pub quota_interval: Duration,
    pub worker_poll_interval: Duration,
    /// Tasks leased per queue per poll.
    pub queue_concurrency: usize,
    /// Age at which failed tasks are purged.
    pub failed_task_retention: Duration,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("VMFLEET_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid VMFLEET_LISTEN_ADDR")?;

        let log_level = var("VMFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = var("VMFLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let compute_endpoint = var("VMFLEET_COMPUTE_ENDPOINT")
            .unwrap_or_else(|| DEFAULT_COMPUTE_ENDPOINT.to_string());

        let access_token = var("VMFLEET_ACCESS_TOKEN").filter(|t| !t.is_empty());

        let cron_interval = Duration::from_secs(number(&var, "VMFLEET_CRON_INTERVAL_SECS", 60)?);
        let quota_interval =
            Duration::from_secs(number(&var, "VMFLEET_QUOTA_INTERVAL_SECS", 300)?);
        let worker_poll_interval =
            Duration::from_millis(number(&var, "VMFLEET_WORKER_POLL_MS", 500)?);
        let queue_concurrency = number(&var, "VMFLEET_QUEUE_CONCURRENCY", 10)?;
        let failed_task_retention = Duration::from_secs(number(
            &var,
            "VMFLEET_FAILED_TASK_RETENTION_SECS",
            DEFAULT_FAILED_TASK_RETENTION.as_secs(),
        )?);

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database: DbConfig::from_lookup(&var),
            compute_endpoint,
            access_token,
            cron_interval,
            quota_interval,
            worker_poll_interval,
            queue_concurrency,
            failed_task_retention,
        })
    }

    pub fn cron_intervals(&self) -> CronIntervals {
        CronIntervals::new(self.cron_interval, self.quota_interval)
    }
}

fn number<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(v) => v.parse().with_context(|| format!("invalid {key}: {v}")),
        None => Ok(default),
    }
}
