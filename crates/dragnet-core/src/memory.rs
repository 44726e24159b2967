//! In-process store backend.
//!
//! One mutex guards the whole state, so every trait method is atomic with
//! respect to every other. Suitable for single-host runs and tests; use the
//! PostgreSQL store when workers span machines.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::rate_limit::{RateLimitPolicy, Reservation, gcra_reserve};
use crate::store::{HeartbeatStore, QueueStore, RateLimitStore};
use crate::task::{Enqueued, NewTask, QueueCounts, Reclaimed, Task, TaskId, TaskState};
use crate::worker::WorkerHeartbeat;

#[derive(Debug, Default)]
struct MemoryState {
    /// All task records, whatever their state.
    tasks: HashMap<TaskId, Task>,

    /// PENDING ids in claim order. Holds exactly the PENDING tasks.
    pending: VecDeque<TaskId>,

    policies: HashMap<String, RateLimitPolicy>,

    /// GCRA theoretical arrival time per rate-limit key.
    arrivals: HashMap<String, DateTime<Utc>>,

    heartbeats: BTreeMap<String, WorkerHeartbeat>,
}

impl MemoryState {
    fn requeue(task: &mut Task, pending: &mut VecDeque<TaskId>, now: DateTime<Utc>) {
        task.state = TaskState::Pending;
        task.claimed_by = None;
        task.claimed_at = None;
        task.completed_at = None;
        task.updated_at = now;
        pending.push_back(task.id.clone());
    }

    fn revive(task: &mut Task, extra_attempts: u32, pending: &mut VecDeque<TaskId>, now: DateTime<Utc>) {
        task.max_attempts = task.attempts.saturating_add(extra_attempts);
        Self::requeue(task, pending, now);
    }
}

/// Mutex-guarded in-memory implementation of every store trait.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the state lock, recovering from poison if necessary.
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned memory store mutex");
            poisoned.into_inner()
        })
    }
}

impl QueueStore for MemoryStore {
    async fn insert(
        &self,
        new_task: NewTask,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, AppError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        if let Some(task) = state.tasks.get_mut(&new_task.id) {
            if !task.state.is_revivable() {
                return Ok(Enqueued::Duplicate);
            }
            task.payload = new_task.payload;
            task.last_error = None;
            MemoryState::revive(task, max_attempts, &mut state.pending, now);
            return Ok(Enqueued::Revived);
        }

        let task = Task::pending(new_task.id.clone(), new_task.payload, max_attempts, now);
        state.pending.push_back(new_task.id.clone());
        state.tasks.insert(new_task.id, task);
        Ok(Enqueued::Created)
    }

    async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>, AppError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        while let Some(id) = state.pending.pop_front() {
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            if task.state != TaskState::Pending {
                continue;
            }
            task.state = TaskState::Claimed;
            task.claimed_by = Some(worker_id.to_string());
            task.claimed_at = Some(now);
            task.attempts += 1;
            task.updated_at = now;
            return Ok(Some(task.clone()));
        }
        Ok(None)
    }

    async fn complete(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool, AppError> {
        let mut state = self.lock();
        match state.tasks.get_mut(task_id) {
            Some(task) if task.state == TaskState::Claimed => {
                task.state = TaskState::Done;
                task.claimed_by = None;
                task.claimed_at = None;
                task.completed_at = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        task_id: &TaskId,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskState>, AppError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(None);
        };
        if task.state != TaskState::Claimed {
            return Ok(None);
        }

        let next = task.state_after_failure(retryable);
        task.last_error = Some(error.to_string());
        if next == TaskState::Pending {
            MemoryState::requeue(task, &mut state.pending, now);
        } else {
            task.state = next;
            task.claimed_by = None;
            task.claimed_at = None;
            task.completed_at = Some(now);
            task.updated_at = now;
        }
        Ok(Some(next))
    }

    async fn reclaim(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reclaimed>, AppError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let mut expired: Vec<(DateTime<Utc>, TaskId)> = state
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Claimed)
            .filter_map(|t| t.claimed_at.filter(|at| *at <= cutoff).map(|at| (at, t.id.clone())))
            .collect();
        expired.sort();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (_, id) in expired {
            let Some(task) = state.tasks.get_mut(&id) else {
                continue;
            };
            let previous_owner = task.claimed_by.clone();
            task.last_error = Some(format!(
                "lease held by {} expired",
                previous_owner.as_deref().unwrap_or("unknown worker")
            ));
            MemoryState::requeue(task, &mut state.pending, now);
            reclaimed.push(Reclaimed {
                id,
                previous_owner,
                state: TaskState::Pending,
            });
        }
        Ok(reclaimed)
    }

    async fn revive(
        &self,
        task_id: &TaskId,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut guard = self.lock();
        let state = &mut *guard;

        match state.tasks.get_mut(task_id) {
            Some(task) if task.state.is_revivable() => {
                MemoryState::revive(task, extra_attempts, &mut state.pending, now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revive_all(
        &self,
        target: TaskState,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        if !target.is_revivable() {
            return Err(AppError::Validation(format!(
                "only failed or dead tasks can be revived, not {target}"
            )));
        }

        let mut guard = self.lock();
        let state = &mut *guard;

        let mut ids: Vec<(DateTime<Utc>, TaskId)> = state
            .tasks
            .values()
            .filter(|t| t.state == target)
            .map(|t| (t.updated_at, t.id.clone()))
            .collect();
        ids.sort();

        let mut count = 0u64;
        for (_, id) in ids {
            if let Some(task) = state.tasks.get_mut(&id) {
                MemoryState::revive(task, extra_attempts, &mut state.pending, now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, AppError> {
        Ok(self.lock().tasks.get(task_id).cloned())
    }

    async fn list(&self, filter: Option<TaskState>, limit: usize) -> Result<Vec<Task>, AppError> {
        let state = self.lock();

        if filter == Some(TaskState::Pending) {
            return Ok(state
                .pending
                .iter()
                .filter_map(|id| state.tasks.get(id))
                .take(limit)
                .cloned()
                .collect());
        }

        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.is_none_or(|s| t.state == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        tasks.truncate(limit);
        Ok(tasks)
    }

    async fn counts(&self) -> Result<QueueCounts, AppError> {
        let state = self.lock();
        let mut counts = QueueCounts::default();
        for task in state.tasks.values() {
            counts.add(task.state, 1);
        }
        Ok(counts)
    }

    async fn purge(&self) -> Result<u64, AppError> {
        let mut state = self.lock();
        let removed = state.tasks.len() as u64;
        state.tasks.clear();
        state.pending.clear();
        Ok(removed)
    }
}

impl RateLimitStore for MemoryStore {
    async fn load_policy(&self, key: &str) -> Result<Option<RateLimitPolicy>, AppError> {
        Ok(self.lock().policies.get(key).copied())
    }

    async fn save_policy(&self, key: &str, policy: RateLimitPolicy) -> Result<(), AppError> {
        self.lock().policies.insert(key.to_string(), policy);
        Ok(())
    }

    async fn reserve(
        &self,
        key: &str,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Reservation, AppError> {
        let mut state = self.lock();
        let (decision, next) = gcra_reserve(state.arrivals.get(key).copied(), policy, now);
        if let Some(tat) = next {
            state.arrivals.insert(key.to_string(), tat);
        }
        Ok(decision)
    }
}

impl HeartbeatStore for MemoryStore {
    async fn beat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), AppError> {
        self.lock()
            .heartbeats
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }

    async fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, AppError> {
        Ok(self.lock().heartbeats.values().cloned().collect())
    }
}
