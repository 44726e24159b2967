//! Queueing protocol: enqueue, claim, acknowledge, reclaim.
//!
//! ```text
//!             enqueue                 claim
//!   (new) ───────────> PENDING ───────────────> CLAIMED ──ack_success──> DONE
//!                        ^  ^                    │  │
//!                        │  └──ack_failure───────┘  ├──ack_failure (ceiling)──> DEAD
//!                        │     (retryable)          ├──ack_failure (permanent)─> FAILED
//!                        └────reclaim_expired───────┘
//! ```
//!
//! Each arrow is a single atomic store operation. The "lock" a worker holds
//! on a task is logical (CLAIMED + owner + timestamp), never a held
//! connection, so a crashed worker cannot wedge the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::error::AppError;
use crate::store::QueueStore;
use crate::task::{
    Enqueued, NewTask, QueueCounts, Reclaimed, Task, TaskId, TaskState, validate_max_attempts,
    validate_payload,
};

/// Owns the queueing protocol on top of a [`QueueStore`].
#[derive(Clone)]
pub struct TaskManager<S: QueueStore> {
    store: S,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl<S: QueueStore> TaskManager<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(store: S, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Enqueue one entity by business key. Returns whether a task entered
    /// PENDING; `false` means the id was already pending, claimed or done.
    pub async fn enqueue(&self, key: &str, payload: serde_json::Value) -> Result<bool, AppError> {
        let outcome = self.submit(NewTask::new(key, payload)?).await?;
        Ok(outcome.is_new())
    }

    /// Enqueue a prepared task.
    pub async fn submit(&self, task: NewTask) -> Result<Enqueued, AppError> {
        validate_payload(&task.payload)?;
        let max_attempts =
            validate_max_attempts(task.max_attempts.unwrap_or(self.config.max_attempts))?;

        let id = task.id.clone();
        let outcome = self
            .store
            .insert(task, max_attempts, self.clock.now())
            .await?;
        match outcome {
            Enqueued::Created => tracing::debug!(task_id = %id, "Task enqueued"),
            Enqueued::Revived => tracing::info!(task_id = %id, "Task re-enqueued"),
            Enqueued::Duplicate => tracing::debug!(task_id = %id, "Task already tracked"),
        }
        Ok(outcome)
    }

    /// Claim the oldest pending task for `worker_id`.
    ///
    /// `Ok(None)` is the "no work available" signal, not an error.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Task>, AppError> {
        if self.config.reclaim_on_claim {
            self.sweep().await?;
        }
        let task = self.store.claim(worker_id, self.clock.now()).await?;
        if let Some(task) = &task {
            tracing::debug!(
                task_id = %task.id,
                %worker_id,
                attempt = task.attempts,
                max_attempts = task.max_attempts,
                "Task claimed"
            );
        }
        Ok(task)
    }

    /// Mark a claimed task DONE. A task that is no longer CLAIMED is left
    /// alone and `false` is returned; straggler acks are expected.
    pub async fn ack_success(&self, task_id: &TaskId) -> Result<bool, AppError> {
        let applied = self.store.complete(task_id, self.clock.now()).await?;
        if !applied {
            tracing::debug!(%task_id, "Ignoring success ack for task that is not claimed");
        }
        Ok(applied)
    }

    /// Record a failed attempt. Retryable errors send the task to the back
    /// of PENDING until the ceiling, then to DEAD; permanent errors send it
    /// to FAILED. Returns the new state, or `None` for a stale ack.
    pub async fn ack_failure(
        &self,
        task_id: &TaskId,
        error: &AppError,
    ) -> Result<Option<TaskState>, AppError> {
        let message = error.to_string();
        let next = self
            .store
            .fail(task_id, &message, error.is_retryable(), self.clock.now())
            .await?;

        match next {
            Some(TaskState::Pending) => {
                tracing::info!(%task_id, error = %message, "Task failed, will retry")
            }
            Some(state) => {
                tracing::warn!(%task_id, error = %message, %state, "Task failed permanently")
            }
            None => {
                tracing::debug!(%task_id, "Ignoring failure ack for task that is not claimed")
            }
        }
        Ok(next)
    }

    /// Return tasks whose lease began at least `lease_timeout` ago to PENDING.
    pub async fn reclaim_expired(
        &self,
        lease_timeout: Duration,
    ) -> Result<Vec<Reclaimed>, AppError> {
        let now = self.clock.now();
        let lease = TimeDelta::from_std(lease_timeout).unwrap_or(TimeDelta::MAX);
        let cutoff = now
            .checked_sub_signed(lease)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let reclaimed = self.store.reclaim(cutoff, now).await?;
        for r in &reclaimed {
            tracing::warn!(
                task_id = %r.id,
                previous_owner = ?r.previous_owner,
                state = %r.state,
                "Reclaimed expired lease"
            );
        }
        Ok(reclaimed)
    }

    /// [`Self::reclaim_expired`] with the configured lease timeout.
    pub async fn sweep(&self) -> Result<Vec<Reclaimed>, AppError> {
        self.reclaim_expired(self.config.lease_timeout).await
    }

    pub async fn counts(&self) -> Result<QueueCounts, AppError> {
        self.store.counts().await
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, AppError> {
        self.store.get(task_id).await
    }

    pub async fn list(
        &self,
        state: Option<TaskState>,
        limit: usize,
    ) -> Result<Vec<Task>, AppError> {
        self.store.list(state, limit).await
    }

    /// Operator action: put a FAILED or DEAD task back in the queue with a
    /// fresh budget of `max_attempts` attempts.
    pub async fn revive(&self, task_id: &TaskId) -> Result<bool, AppError> {
        let extra = validate_max_attempts(self.config.max_attempts)?;
        let revived = self
            .store
            .revive(task_id, extra, self.clock.now())
            .await?;
        if revived {
            tracing::info!(%task_id, "Task revived");
        }
        Ok(revived)
    }

    /// Operator action: revive every task in `state` (FAILED or DEAD).
    pub async fn revive_all(&self, state: TaskState) -> Result<u64, AppError> {
        let extra = validate_max_attempts(self.config.max_attempts)?;
        let count = self
            .store
            .revive_all(state, extra, self.clock.now())
            .await?;
        tracing::info!(%state, count, "Tasks revived");
        Ok(count)
    }

    /// Operator action: drop every task in every queue.
    pub async fn purge(&self) -> Result<u64, AppError> {
        let removed = self.store.purge().await?;
        tracing::warn!(removed, "All queues have been reset");
        Ok(removed)
    }
}

impl<S: QueueStore + 'static> TaskManager<S> {
    /// Run [`Self::sweep`] every `sweep_interval` until `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(manager.config.sweep_interval);
            timer.tick().await;

            tracing::info!(interval = ?manager.config.sweep_interval, "Lease sweeper started");
            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    () = cancel.cancelled() => break,
                }
                if let Err(e) = manager.sweep().await {
                    tracing::error!(error = %e, "Lease sweep failed");
                }
            }
            tracing::info!("Lease sweeper stopped");
        })
    }
}
