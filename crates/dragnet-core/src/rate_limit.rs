//! Cluster-wide throttle on how fast workers may start scraping attempts.
//!
//! The budget lives in the shared store rather than in process memory,
//! so every worker on every machine draws from the same bucket. The
//! algorithm is GCRA (a token bucket kept as a single "theoretical arrival
//! time" per key): each granted slot pushes the arrival time forward by
//! `window / limit`, and a request is allowed while the arrival time is no
//! more than one full burst ahead of now.
//!
//! ```text
//! T   = window / limit          emission interval
//! tau = T * (limit - 1)         burst tolerance
//! grant if  max(tat, now) - tau <= now ;  tat' = max(tat, now) + T
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dragnet_core::clock::SystemClock;
//! use dragnet_core::memory::MemoryStore;
//! use dragnet_core::rate_limit::{RateLimiter, RateLimiterConfig, RateLimitPolicy};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! let config = RateLimiterConfig::new(RateLimitPolicy::per_minute(60)?);
//! let limiter = RateLimiter::new(store, Arc::new(SystemClock), config);
//! limiter.acquire().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::AppError;
use crate::store::RateLimitStore;

/// Key under which the worker fleet shares its scraping budget.
pub const DEFAULT_RATE_LIMIT_KEY: &str = "scrape";

/// At most `limit` attempts per `window`, with bursts of up to `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(limit: u32, window: Duration) -> Result<Self, AppError> {
        if limit == 0 {
            return Err(AppError::ConfigError(
                "rate limit must allow at least one attempt per window".into(),
            ));
        }
        if window.is_zero() {
            return Err(AppError::ConfigError(
                "rate limit window must be longer than zero".into(),
            ));
        }
        Ok(Self { limit, window })
    }

    pub fn per_minute(limit: u32) -> Result<Self, AppError> {
        Self::new(limit, Duration::from_secs(60))
    }

    /// Spacing between slots once the burst is used up.
    pub fn emission_interval(&self) -> Duration {
        self.window / self.limit
    }

    /// How far ahead of now the arrival time may run.
    pub fn burst_tolerance(&self) -> Duration {
        self.emission_interval() * (self.limit - 1)
    }

    /// Equivalent sustained attempts per minute.
    pub fn per_minute_rate(&self) -> f64 {
        self.limit as f64 * 60.0 / self.window.as_secs_f64()
    }
}

/// Outcome of one attempt to take a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    /// Denied; the next slot opens after this long.
    Wait(Duration),
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Evaluate GCRA for one request. Returns the decision and, when granted,
/// the arrival time to store.
pub fn gcra_reserve(
    tat: Option<DateTime<Utc>>,
    policy: RateLimitPolicy,
    now: DateTime<Utc>,
) -> (Reservation, Option<DateTime<Utc>>) {
    let tat = tat.map_or(now, |t| t.max(now));
    let allow_at = tat - delta(policy.burst_tolerance());

    if allow_at <= now {
        (
            Reservation::Granted,
            Some(tat + delta(policy.emission_interval())),
        )
    } else {
        let wait = (allow_at - now).to_std().unwrap_or_default();
        (Reservation::Wait(wait), None)
    }
}

/// Configuration for the rate limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Bucket shared by every limiter using the same key.
    pub key: String,

    /// Policy used until one is saved in the store.
    pub default_policy: RateLimitPolicy,

    /// Pause before retrying when the store cannot be reached.
    pub error_backoff: Duration,
}

impl RateLimiterConfig {
    pub fn new(default_policy: RateLimitPolicy) -> Self {
        Self {
            key: DEFAULT_RATE_LIMIT_KEY.to_string(),
            default_policy,
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Gate in front of every scraping attempt.
#[derive(Clone)]
pub struct RateLimiter<S: RateLimitStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: RateLimiterConfig,
}

impl<S: RateLimitStore> RateLimiter<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, config: RateLimiterConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// The policy in force right now: the saved one, else the default.
    pub async fn policy(&self) -> RateLimitPolicy {
        match self.store.load_policy(&self.config.key).await {
            Ok(Some(policy)) => policy,
            Ok(None) => self.config.default_policy,
            Err(e) => {
                tracing::warn!(
                    key = %self.config.key,
                    error = %e,
                    "Failed to load rate limit policy, using default"
                );
                self.config.default_policy
            }
        }
    }

    /// Save a new policy for every worker sharing this key. Takes effect on
    /// their next `acquire()`.
    pub async fn set_policy(&self, policy: RateLimitPolicy) -> Result<(), AppError> {
        self.store.save_policy(&self.config.key, policy).await?;
        tracing::info!(
            key = %self.config.key,
            limit = policy.limit,
            window_secs = policy.window.as_secs_f64(),
            "Rate limit policy updated"
        );
        Ok(())
    }

    /// Wait until a slot is available, then take it.
    ///
    /// Never fails: store errors are logged and retried. Returns the total
    /// time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let policy = self.policy().await;
            match self
                .store
                .reserve(&self.config.key, policy, self.clock.now())
                .await
            {
                Ok(Reservation::Granted) => return waited,
                Ok(Reservation::Wait(wait)) => {
                    tracing::debug!(
                        key = %self.config.key,
                        sleep_ms = %wait.as_millis(),
                        "Throttling attempt"
                    );
                    tokio::time::sleep(wait).await;
                    waited += wait;
                }
                Err(e) => {
                    tracing::warn!(
                        key = %self.config.key,
                        error = %e,
                        "Rate limit store unavailable, retrying"
                    );
                    tokio::time::sleep(self.config.error_backoff).await;
                    waited += self.config.error_backoff;
                }
            }
        }
    }
}
