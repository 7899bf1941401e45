// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Work-execution configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of works executed concurrently by the worker pool
    pub worker_count: usize,
    /// Bounded wait for the process-instance lock
    pub lock_timeout: Duration,
    /// Number of entities re-registered per restart transaction
    pub restart_batch_size: usize,
    /// How long an idle worker sleeps before polling the queue again
    pub poll_interval: Duration,
    /// Deliveries of a retryable work before it is given up on
    pub max_attempts: u32,
    /// Base redelivery delay, multiplied by the attempt number
    pub retry_delay: Duration,
    /// Upper bound for the out-of-transaction connector call
    pub connector_timeout: Duration,
    /// Tenant the restart handlers register works for
    pub tenant_id: Option<i64>,
    /// SQLite connection URL for the durable queue and incident log, opened by
    /// [`crate::services::ServicesBuilder::connect`] (in-memory queue when unset)
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 8,
            lock_timeout: Duration::from_millis(20),
            restart_batch_size: 20,
            poll_interval: Duration::from_millis(100),
            max_attempts: 10,
            retry_delay: Duration::from_millis(500),
            connector_timeout: Duration::from_secs(300),
            tenant_id: None,
            database_url: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `FLOWLATCH_WORKER_COUNT`: Concurrent works (default: 8)
    /// - `FLOWLATCH_LOCK_TIMEOUT_MS`: Bounded lock wait (default: 20)
    /// - `FLOWLATCH_RESTART_BATCH_SIZE`: Restart batch size (default: 20)
    /// - `FLOWLATCH_POLL_INTERVAL_MS`: Idle poll interval (default: 100)
    /// - `FLOWLATCH_MAX_ATTEMPTS`: Deliveries per work (default: 10)
    /// - `FLOWLATCH_RETRY_DELAY_MS`: Base redelivery delay (default: 500)
    /// - `FLOWLATCH_CONNECTOR_TIMEOUT_SECS`: Connector call timeout (default: 300)
    /// - `FLOWLATCH_TENANT_ID`: Tenant used for restart registrations (default: none)
    /// - `FLOWLATCH_DATABASE_URL`: SQLite URL for the durable queue (default: none)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let worker_count: usize = positive(
            "FLOWLATCH_WORKER_COUNT",
            defaults.worker_count,
            "must be a positive integer",
        )?;
        let lock_timeout_ms: u64 = parse(
            "FLOWLATCH_LOCK_TIMEOUT_MS",
            defaults.lock_timeout.as_millis() as u64,
            "must be a number of milliseconds",
        )?;
        let restart_batch_size: usize = positive(
            "FLOWLATCH_RESTART_BATCH_SIZE",
            defaults.restart_batch_size,
            "must be a positive integer",
        )?;
        let poll_interval_ms: u64 = parse(
            "FLOWLATCH_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
            "must be a number of milliseconds",
        )?;
        let max_attempts: u32 = positive(
            "FLOWLATCH_MAX_ATTEMPTS",
            defaults.max_attempts,
            "must be a positive integer",
        )?;
        let retry_delay_ms: u64 = parse(
            "FLOWLATCH_RETRY_DELAY_MS",
            defaults.retry_delay.as_millis() as u64,
            "must be a number of milliseconds",
        )?;
        let connector_timeout_secs: u64 = positive(
            "FLOWLATCH_CONNECTOR_TIMEOUT_SECS",
            defaults.connector_timeout.as_secs(),
            "must be a positive number of seconds",
        )?;

        let tenant_id = match std::env::var("FLOWLATCH_TENANT_ID") {
            Ok(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| ConfigError::Invalid("FLOWLATCH_TENANT_ID", "must be an integer"))?,
            ),
            Err(_) => None,
        };

        let database_url = std::env::var("FLOWLATCH_DATABASE_URL").ok();

        Ok(Self {
            worker_count,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            restart_batch_size,
            poll_interval: Duration::from_millis(poll_interval_ms),
            max_attempts,
            retry_delay: Duration::from_millis(retry_delay_ms),
            connector_timeout: Duration::from_secs(connector_timeout_secs),
            tenant_id,
            database_url,
        })
    }
}

fn parse<T: FromStr>(name: &'static str, default: T, hint: &'static str) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name, hint)),
        Err(_) => Ok(default),
    }
}

fn positive<T>(name: &'static str, default: T, hint: &'static str) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let value = parse(name, default, hint)?;
    if value == T::default() {
        return Err(ConfigError::Invalid(name, hint));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
