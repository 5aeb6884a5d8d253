//! Environment-driven runtime configuration.
//!
//! Defaults are development-friendly; every `PROXY_*` variable the core
//! recognizes overrides its field, with validation (non-negative integers
//! where zero is meaningful, positive integers elsewhere, caps applied).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use proxy_delivery::{DeliveryConfig, MAX_CONCURRENCY};

/// Resolved configuration for one node.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding the transaction log (and the SQLite file when no
    /// explicit path is given).
    pub data_dir: PathBuf,
    /// SQLite database path; `None` runs memory-only (txlog-backed).
    pub db_path: Option<PathBuf>,
    /// Tick interval for the background scheduler.
    pub autotick_interval_ms: u64,
    /// Outbound delivery HTTP timeout; 0 disables the timeout.
    pub delivery_http_timeout_ms: u64,
    /// Parallel delivery scope groups; capped at 50.
    pub worker_concurrency_deliveries: usize,
    /// Retention for delivered rows in days; 0 = no cap.
    pub retention_deliveries_max_days: u32,
    /// Retention for dead-lettered rows in days; 0 = no cap.
    pub retention_delivery_dlq_max_days: u32,
    /// Delivery attempt budget.
    pub delivery_max_attempts: u32,
    /// Backoff base in milliseconds.
    pub delivery_backoff_base_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub delivery_backoff_max_ms: u64,
    /// Outbox messages drained per tick.
    pub outbox_batch: usize,
    /// Deliveries claimed per tick.
    pub delivery_batch: usize,
    /// Listen host for the API surface (carried for the outer layers).
    pub bind_host: String,
    /// Allowed CORS origins (carried for the outer layers).
    pub cors_allow_origins: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            db_path: None,
            autotick_interval_ms: 5_000,
            delivery_http_timeout_ms: 10_000,
            worker_concurrency_deliveries: 8,
            retention_deliveries_max_days: 0,
            retention_delivery_dlq_max_days: 0,
            delivery_max_attempts: 5,
            delivery_backoff_base_ms: 1_000,
            delivery_backoff_max_ms: 60_000,
            outbox_batch: 256,
            delivery_batch: 64,
            bind_host: "127.0.0.1".to_string(),
            cors_allow_origins: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(timeout) = read_u64("PROXY_DELIVERY_HTTP_TIMEOUT_MS")? {
            // 0 is meaningful: no timeout.
            config.delivery_http_timeout_ms = timeout;
        }
        if let Some(concurrency) = read_u64("PROXY_WORKER_CONCURRENCY_DELIVERIES")? {
            if concurrency == 0 {
                bail!("PROXY_WORKER_CONCURRENCY_DELIVERIES must be positive");
            }
            config.worker_concurrency_deliveries = (concurrency as usize).min(MAX_CONCURRENCY);
        }
        if let Some(days) = read_u64("PROXY_RETENTION_DELIVERIES_MAX_DAYS")? {
            config.retention_deliveries_max_days = clamp_days("PROXY_RETENTION_DELIVERIES_MAX_DAYS", days)?;
        }
        if let Some(days) = read_u64("PROXY_RETENTION_DELIVERY_DLQ_MAX_DAYS")? {
            config.retention_delivery_dlq_max_days =
                clamp_days("PROXY_RETENTION_DELIVERY_DLQ_MAX_DAYS", days)?;
        }
        if let Some(interval) = read_u64("PROXY_AUTOTICK_INTERVAL_MS")? {
            if interval == 0 {
                bail!("PROXY_AUTOTICK_INTERVAL_MS must be positive");
            }
            config.autotick_interval_ms = interval;
        }
        if let Some(host) = read_string("PROXY_BIND_HOST").or_else(|| read_string("BIND_HOST")) {
            config.bind_host = host;
        }
        if let Some(origins) = read_string("PROXY_CORS_ALLOW_ORIGINS") {
            config.cors_allow_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_owned)
                .collect();
        }
        Ok(config)
    }

    /// The delivery worker view of this configuration.
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: self.delivery_max_attempts,
            backoff_base_ms: self.delivery_backoff_base_ms,
            backoff_max_ms: self.delivery_backoff_max_ms,
            http_timeout_ms: self.delivery_http_timeout_ms,
            concurrency: self.worker_concurrency_deliveries,
            retention_delivered_days: self.retention_deliveries_max_days,
            retention_dlq_days: self.retention_delivery_dlq_max_days,
            ..DeliveryConfig::default()
        }
    }

    /// Path of the transaction log under the data directory.
    pub fn txlog_path(&self) -> PathBuf {
        self.data_dir.join("tx.log")
    }
}

fn read_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn read_u64(name: &str) -> Result<Option<u64>> {
    match read_string(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .with_context(|| format!("{name} must be a non-negative integer, got {raw:?}")),
        None => Ok(None),
    }
}

fn clamp_days(name: &str, days: u64) -> Result<u32> {
    u32::try_from(days).with_context(|| format!("{name} is out of range: {days}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RuntimeConfig::default();
        assert_eq!(config.delivery_max_attempts, 5);
        assert_eq!(config.worker_concurrency_deliveries, 8);
        assert!(config.db_path.is_none());
        assert!(config.txlog_path().ends_with("tx.log"));
    }

    #[test]
    fn delivery_config_carries_the_env_knobs() {
        let config = RuntimeConfig {
            delivery_http_timeout_ms: 0,
            worker_concurrency_deliveries: 50,
            retention_delivery_dlq_max_days: 14,
            ..RuntimeConfig::default()
        };
        let delivery = config.delivery_config();
        assert_eq!(delivery.http_timeout_ms, 0);
        assert_eq!(delivery.concurrency, 50);
        assert_eq!(delivery.retention_dlq_days, 14);
    }
}
