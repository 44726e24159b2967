//! Read-only view of queue progress and worker liveness.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::error::AppError;
use crate::store::{HeartbeatStore, QueueStore};
use crate::task::{QueueCounts, TaskId, TaskState};
use crate::worker::{WorkerHeartbeat, WorkerState};

pub const DEFAULT_STALL_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    #[serde(flatten)]
    pub heartbeat: WorkerHeartbeat,
    /// Running but silent for longer than the stall threshold.
    pub stalled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub counts: QueueCounts,
    pub workers: Vec<WorkerStatus>,
    pub taken_at: DateTime<Utc>,
}

impl MonitorSnapshot {
    pub fn active_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.heartbeat.state != WorkerState::Stopped && !w.stalled)
            .count()
    }

    pub fn stalled_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.stalled).count()
    }
}

/// A task that ended in FAILED or DEAD, with the error that put it there.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub id: TaskId,
    pub state: TaskState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Monitor<S> {
    store: S,
    clock: Arc<dyn Clock>,
    stall_after: Duration,
}

impl<S: QueueStore + HeartbeatStore> Monitor<S> {
    pub fn new(store: S) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            stall_after: DEFAULT_STALL_AFTER,
        }
    }

    pub fn with_stall_after(mut self, stall_after: Duration) -> Self {
        self.stall_after = stall_after;
        self
    }

    pub async fn snapshot(&self) -> Result<MonitorSnapshot, AppError> {
        let counts = self.store.counts().await?;
        let workers = self.workers().await?;
        Ok(MonitorSnapshot {
            counts,
            workers,
            taken_at: self.clock.now(),
        })
    }

    pub async fn workers(&self) -> Result<Vec<WorkerStatus>, AppError> {
        let now = self.clock.now();
        let stall_after = TimeDelta::from_std(self.stall_after).unwrap_or(TimeDelta::MAX);

        let mut workers: Vec<WorkerStatus> = self
            .store
            .heartbeats()
            .await?
            .into_iter()
            .map(|heartbeat| {
                let stalled = heartbeat.state != WorkerState::Stopped
                    && now - heartbeat.last_seen > stall_after;
                WorkerStatus { heartbeat, stalled }
            })
            .collect();
        workers.sort_by(|a, b| a.heartbeat.worker_id.cmp(&b.heartbeat.worker_id));
        Ok(workers)
    }

    /// Most recent FAILED and DEAD tasks, newest first.
    pub async fn recent_failures(&self, limit: usize) -> Result<Vec<FailureRecord>, AppError> {
        let mut failures = Vec::new();
        for state in [TaskState::Dead, TaskState::Failed] {
            failures.extend(self.store.list(Some(state), limit).await?);
        }
        failures.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        failures.truncate(limit);

        Ok(failures
            .into_iter()
            .map(|t| FailureRecord {
                id: t.id,
                state: t.state,
                attempts: t.attempts,
                last_error: t.last_error,
                updated_at: t.updated_at,
            })
            .collect())
    }
}

/// Throughput and time-to-drain derived from successive snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Progress {
    pub finished: u64,
    pub outstanding: u64,
    /// Share of all tasks that reached a terminal state, 0.0..=1.0.
    pub ratio: f64,
    /// Tasks finished per second over the tracking window.
    pub throughput: Option<f64>,
    pub eta: Option<Duration>,
}

/// Keeps a sliding window of `(time, finished)` samples.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    samples: VecDeque<(DateTime<Utc>, u64)>,
    capacity: usize,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ProgressTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.max(2)),
            capacity: capacity.max(2),
        }
    }

    pub fn record(&mut self, counts: &QueueCounts, at: DateTime<Utc>) -> Progress {
        let finished = counts.finished();
        let outstanding = counts.outstanding();

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, finished));

        let throughput = match (self.samples.front(), self.samples.back()) {
            (Some(&(t0, f0)), Some(&(t1, f1))) if t1 > t0 && f1 >= f0 => {
                let secs = (t1 - t0).num_milliseconds() as f64 / 1000.0;
                Some((f1 - f0) as f64 / secs)
            }
            _ => None,
        };

        let eta = match throughput {
            _ if outstanding == 0 => Some(Duration::ZERO),
            Some(rate) if rate > 0.0 => Some(Duration::from_secs_f64(outstanding as f64 / rate)),
            _ => None,
        };

        let total = counts.total();
        Progress {
            finished,
            outstanding,
            ratio: if total == 0 {
                0.0
            } else {
                finished as f64 / total as f64
            },
            throughput,
            eta,
        }
    }
}
