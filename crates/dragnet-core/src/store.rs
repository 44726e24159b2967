use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::rate_limit::{RateLimitPolicy, Reservation};
use crate::task::{Enqueued, NewTask, QueueCounts, Reclaimed, Task, TaskId, TaskState};
use crate::worker::WorkerHeartbeat;

/// Durable, shared task store: the single source of truth for which tasks
/// are pending, in flight, done, failed or dead.
///
/// Every mutating method must be one atomic operation of the backend
/// (a mutex-guarded update, a single SQL statement, ...). Callers never
/// check-then-act across two calls.
pub trait QueueStore: Send + Sync + Clone {
    /// Insert a task into PENDING unless its id is already PENDING, CLAIMED
    /// or DONE. A FAILED or DEAD task with the same id is revived with
    /// `max_attempts` fresh attempts and the new payload.
    fn insert(
        &self,
        task: NewTask,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Enqueued, AppError>> + Send;

    /// Atomically pop the oldest PENDING task, mark it CLAIMED by
    /// `worker_id` at `now` and increment its attempts.
    ///
    /// Returns `None` if no tasks are pending.
    fn claim(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    /// Move a CLAIMED task to DONE. Returns `false` (and changes nothing)
    /// if the task is not currently CLAIMED.
    fn complete(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Record a failed attempt on a CLAIMED task, moving it according to
    /// [`Task::state_after_failure`]. Returns the new state, or `None` if the
    /// task was not CLAIMED.
    fn fail(
        &self,
        task_id: &TaskId,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<TaskState>, AppError>> + Send;

    /// Return every CLAIMED task whose lease began at or before `cutoff`
    /// to the back of PENDING. `attempts` is left unchanged.
    fn reclaim(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Reclaimed>, AppError>> + Send;

    /// Move one FAILED or DEAD task back to PENDING, raising its ceiling to
    /// `attempts + extra_attempts`.
    fn revive(
        &self,
        task_id: &TaskId,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Revive every task in `state` (FAILED or DEAD). Returns how many moved.
    fn revive_all(
        &self,
        state: TaskState,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get(
        &self,
        task_id: &TaskId,
    ) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    /// List tasks, optionally filtered by state, in queue order for PENDING
    /// and most recently updated first otherwise.
    fn list(
        &self,
        state: Option<TaskState>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Task>, AppError>> + Send;

    fn counts(&self) -> impl Future<Output = Result<QueueCounts, AppError>> + Send;

    /// Delete every task in every state. Returns how many were removed.
    fn purge(&self) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Shared rate-limit state, hosted next to the queue so that workers on
/// different machines draw from the same budget.
pub trait RateLimitStore: Send + Sync + Clone {
    /// The currently configured policy for `key`, if any was saved.
    fn load_policy(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<RateLimitPolicy>, AppError>> + Send;

    fn save_policy(
        &self,
        key: &str,
        policy: RateLimitPolicy,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Atomically try to take one slot from `key` under `policy`.
    fn reserve(
        &self,
        key: &str,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Reservation, AppError>> + Send;
}

/// Liveness records written by workers and read by monitors.
pub trait HeartbeatStore: Send + Sync + Clone {
    fn beat(
        &self,
        heartbeat: &WorkerHeartbeat,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn heartbeats(&self) -> impl Future<Output = Result<Vec<WorkerHeartbeat>, AppError>> + Send;
}
