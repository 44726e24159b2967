//! Test utilities: mock collaborators and a fault-injecting store.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::rate_limit::{RateLimitPolicy, Reservation};
use crate::store::{HeartbeatStore, QueueStore, RateLimitStore};
use crate::task::{Enqueued, NewTask, QueueCounts, Reclaimed, Task, TaskId, TaskState};
use crate::traits::{ProcessOutcome, Processor, ResultStore};
use crate::worker::{WorkerEvent, WorkerHeartbeat, WorkerReporter, WorkerState};

// ---------------------------------------------------------------------------
// MockProcessor
// ---------------------------------------------------------------------------

/// Mock processor that pops scripted responses and records task ids.
#[derive(Clone, Default)]
pub struct MockProcessor {
    /// Each call pops the first element. If empty, succeeds with `{"ok": true}`.
    responses: Arc<Mutex<VecDeque<Result<ProcessOutcome, AppError>>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<Result<ProcessOutcome, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Processor for MockProcessor {
    async fn process(&self, task: &Task) -> Result<ProcessOutcome, AppError> {
        self.calls.lock().unwrap().push(task.id.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ProcessOutcome::new(serde_json::json!({"ok": true}))))
    }
}

// ---------------------------------------------------------------------------
// MockResultStore
// ---------------------------------------------------------------------------

/// Mock result store that records upserts and can fail on demand.
#[derive(Clone, Default)]
pub struct MockResultStore {
    pub written: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    failures: Arc<AtomicU32>,
}

impl MockResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn written_ids(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl ResultStore for MockResultStore {
    async fn upsert_result(
        &self,
        business_id: &TaskId,
        _worker_id: &str,
        fields: &serde_json::Value,
    ) -> Result<(), AppError> {
        if take_failure(&self.failures) {
            return Err(AppError::DatabaseError("injected write failure".into()));
        }
        self.written
            .lock()
            .unwrap()
            .push((business_id.to_string(), fields.clone()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records events.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
    states: Arc<Mutex<Vec<WorkerState>>>,
    failures: Arc<Mutex<Vec<Option<TaskState>>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<WorkerState> {
        self.states.lock().unwrap().clone()
    }

    /// Next state the manager reported for each failed attempt.
    pub fn failures(&self) -> Vec<Option<TaskState>> {
        self.failures.lock().unwrap().clone()
    }

    pub fn store_errors(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == "StoreError")
            .count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::StateChanged { state, .. } => {
                self.states.lock().unwrap().push(*state);
                "StateChanged"
            }
            WorkerEvent::TaskClaimed { .. } => "TaskClaimed",
            WorkerEvent::Throttled { .. } => "Throttled",
            WorkerEvent::TaskCompleted { .. } => "TaskCompleted",
            WorkerEvent::TaskFailed { next_state, .. } => {
                self.failures.lock().unwrap().push(*next_state);
                "TaskFailed"
            }
            WorkerEvent::StoreError { .. } => "StoreError",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// FlakyStore
// ---------------------------------------------------------------------------

/// Wraps a store and fails the next `n` calls to any store method with
/// [`AppError::StoreUnavailable`], without touching the inner store.
#[derive(Clone)]
pub struct FlakyStore<S> {
    inner: S,
    failures: Arc<AtomicU32>,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failures: Arc::default(),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn remaining_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn outage(&self) -> Result<(), AppError> {
        if take_failure(&self.failures) {
            Err(AppError::StoreUnavailable("injected outage".into()))
        } else {
            Ok(())
        }
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl<S: QueueStore> QueueStore for FlakyStore<S> {
    async fn insert(
        &self,
        task: NewTask,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, AppError> {
        self.outage()?;
        self.inner.insert(task, max_attempts, now).await
    }

    async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>, AppError> {
        self.outage()?;
        self.inner.claim(worker_id, now).await
    }

    async fn complete(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool, AppError> {
        self.outage()?;
        self.inner.complete(task_id, now).await
    }

    async fn fail(
        &self,
        task_id: &TaskId,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskState>, AppError> {
        self.outage()?;
        self.inner.fail(task_id, error, retryable, now).await
    }

    async fn reclaim(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reclaimed>, AppError> {
        self.outage()?;
        self.inner.reclaim(cutoff, now).await
    }

    async fn revive(
        &self,
        task_id: &TaskId,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        self.outage()?;
        self.inner.revive(task_id, extra_attempts, now).await
    }

    async fn revive_all(
        &self,
        state: TaskState,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        self.outage()?;
        self.inner.revive_all(state, extra_attempts, now).await
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, AppError> {
        self.outage()?;
        self.inner.get(task_id).await
    }

    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>, AppError> {
        self.outage()?;
        self.inner.list(state, limit).await
    }

    async fn counts(&self) -> Result<QueueCounts, AppError> {
        self.outage()?;
        self.inner.counts().await
    }

    async fn purge(&self) -> Result<u64, AppError> {
        self.outage()?;
        self.inner.purge().await
    }
}

impl<S: RateLimitStore> RateLimitStore for FlakyStore<S> {
    async fn load_policy(&self, key: &str) -> Result<Option<RateLimitPolicy>, AppError> {
        self.outage()?;
        self.inner.load_policy(key).await
    }

    async fn save_policy(&self, key: &str, policy: RateLimitPolicy) -> Result<(), AppError> {
        self.outage()?;
        self.inner.save_policy(key, policy).await
    }

    async fn reserve(
        &self,
        key: &str,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Reservation, AppError> {
        self.outage()?;
        self.inner.reserve(key, policy, now).await
    }
}

impl<S: HeartbeatStore> HeartbeatStore for FlakyStore<S> {
    async fn beat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), AppError> {
        self.outage()?;
        self.inner.beat(heartbeat).await
    }

    async fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, AppError> {
        self.outage()?;
        self.inner.heartbeats().await
    }
}
