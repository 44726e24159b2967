use std::sync::Arc;
use std::time::Duration;

use dragnet_core::TaskManager;
use dragnet_core::clock::{Clock, SystemClock};
use dragnet_core::config::QueueConfig;
use dragnet_core::monitor::Monitor;
use dragnet_core::rate_limit::{RateLimitPolicy, RateLimiter, RateLimiterConfig};
use dragnet_db::{Database, PgTaskStore};

/// Shared application state, available to all route handlers via `State<Arc<AppState>>`.
pub struct AppState {
    pub db: Database,
    pub tasks: TaskManager<PgTaskStore>,
    pub monitor: Monitor<PgTaskStore>,
    pub limiter: RateLimiter<PgTaskStore>,
    /// Admin API key for protecting `/v1` endpoints (None = endpoints disabled).
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(
        db: Database,
        queue: QueueConfig,
        default_rate: RateLimitPolicy,
        admin_token: Option<String>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            tasks: TaskManager::with_clock(db.task_store(), clock.clone(), queue),
            monitor: Monitor::with_clock(db.task_store(), clock.clone()),
            limiter: RateLimiter::new(
                db.task_store(),
                clock,
                RateLimiterConfig::new(default_rate),
            ),
            db,
            admin_token,
        }
    }

    /// Treat workers silent for longer than `stall_after` as stalled.
    pub fn with_stall_after(mut self, stall_after: Duration) -> Self {
        self.monitor = self.monitor.with_stall_after(stall_after);
        self
    }
}
