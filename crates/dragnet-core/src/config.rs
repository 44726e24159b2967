use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::error::AppError;
use crate::monitor::DEFAULT_STALL_AFTER;
use crate::rate_limit::RateLimitPolicy;
use crate::task::{DEFAULT_MAX_ATTEMPTS, validate_max_attempts};

/// Queueing protocol settings used by the task manager.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Retry ceiling for tasks enqueued without their own.
    pub max_attempts: u32,

    /// How long a claim stays valid. Must exceed the worst-case `process` time.
    pub lease_timeout: Duration,

    /// Sweep expired leases before every claim.
    pub reclaim_on_claim: bool,

    /// Cadence of the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lease_timeout: Duration::from_secs(300),
            reclaim_on_claim: true,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DRAGNET_MAX_ATTEMPTS` (default 3)
    /// - `DRAGNET_LEASE_TIMEOUT_SECS` (default 300)
    /// - `DRAGNET_SWEEP_INTERVAL_SECS` (default 30)
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        let max_attempts = validate_max_attempts(env_or(
            "DRAGNET_MAX_ATTEMPTS",
            defaults.max_attempts,
        )?)
        .map_err(|e| AppError::ConfigError(format!("DRAGNET_MAX_ATTEMPTS: {e}")))?;
        Ok(Self {
            max_attempts,
            lease_timeout: env_secs_or("DRAGNET_LEASE_TIMEOUT_SECS", defaults.lease_timeout)?,
            reclaim_on_claim: defaults.reclaim_on_claim,
            sweep_interval: env_secs_or("DRAGNET_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
        })
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_lease_timeout(mut self, lease: Duration) -> Self {
        self.lease_timeout = lease;
        self
    }

    pub fn with_reclaim_on_claim(mut self, enabled: bool) -> Self {
        self.reclaim_on_claim = enabled;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Configuration for one logical worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,

    /// First back-off step while idle; doubles up to `max_poll_interval`.
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,

    /// Stop after this long without finding work.
    pub idle_timeout: Duration,

    /// Stop after processing this many tasks. `None` = unbounded.
    pub max_tasks: Option<u64>,

    /// Pause before retrying a store operation that failed.
    pub store_retry_backoff: Duration,

    /// Give up on an acknowledgement after this many failed tries and let
    /// lease expiry recover the task.
    pub ack_retry_limit: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_tasks: None,
            store_retry_backoff: Duration::from_secs(5),
            ack_retry_limit: 5,
        }
    }
}

impl WorkerConfig {
    /// Read configuration from environment variables.
    ///
    /// - `DRAGNET_IDLE_TIMEOUT_SECS` (default 60)
    /// - `DRAGNET_MAX_TASKS` (default unbounded)
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            idle_timeout: env_secs_or("DRAGNET_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            max_tasks: env_opt("DRAGNET_MAX_TASKS")?,
            ..defaults
        })
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.max_poll_interval = self.max_poll_interval.max(interval);
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_tasks(mut self, max: Option<u64>) -> Self {
        self.max_tasks = max;
        self
    }

    pub fn with_store_retry_backoff(mut self, backoff: Duration) -> Self {
        self.store_retry_backoff = backoff;
        self
    }

    pub fn with_ack_retry_limit(mut self, limit: u32) -> Self {
        self.ack_retry_limit = limit;
        self
    }
}

/// Default producer chunk size.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default rate ceiling, in attempts per minute.
pub const DEFAULT_RATE_PER_MINUTE: u32 = 60;

/// Read `DRAGNET_BATCH_SIZE` (default 1000).
pub fn batch_size_from_env() -> Result<usize, AppError> {
    let size = env_or("DRAGNET_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
    if size == 0 {
        return Err(AppError::ConfigError(
            "DRAGNET_BATCH_SIZE must be at least 1".into(),
        ));
    }
    Ok(size)
}

/// Read `DRAGNET_RATE_LIMIT` as attempts per minute (default 60).
pub fn rate_limit_from_env() -> Result<RateLimitPolicy, AppError> {
    RateLimitPolicy::per_minute(env_or("DRAGNET_RATE_LIMIT", DEFAULT_RATE_PER_MINUTE)?)
}

/// Read `DRAGNET_STALL_AFTER_SECS` (default 120).
pub fn stall_after_from_env() -> Result<Duration, AppError> {
    env_secs_or("DRAGNET_STALL_AFTER_SECS", DEFAULT_STALL_AFTER)
}

fn env_opt<T: FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::ConfigError(format!("Invalid {name} '{raw}': expected a number"))
        }),
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    Ok(env_opt(name)?.unwrap_or(default))
}

fn env_secs_or(name: &str, default: Duration) -> Result<Duration, AppError> {
    Ok(env_opt::<u64>(name)?
        .map(Duration::from_secs)
        .unwrap_or(default))
}
