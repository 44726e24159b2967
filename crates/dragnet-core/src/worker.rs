use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::AppError;
use crate::manager::TaskManager;
use crate::rate_limit::RateLimiter;
use crate::store::{HeartbeatStore, QueueStore, RateLimitStore};
use crate::task::{Task, TaskId, TaskState};
use crate::traits::{Processor, ResultStore};

/// Lifecycle of one logical worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    IdleWait,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::IdleWait => "idle_wait",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "idle_wait" => Ok(Self::IdleWait),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown worker state '{other}'")),
        }
    }
}

/// Liveness record a worker writes on every loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub state: WorkerState,
    pub last_seen: DateTime<Utc>,
    pub tasks_done: u64,
    pub tasks_failed: u64,
    pub current_task: Option<TaskId>,
}

impl WorkerHeartbeat {
    pub fn new(worker_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.into(),
            state: WorkerState::Starting,
            last_seen: now,
            tasks_done: 0,
            tasks_failed: 0,
            current_task: None,
        }
    }
}

/// Why [`WorkerService::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxTasks,
    IdleTimeout,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub stop_reason: StopReason,
}

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    StateChanged {
        worker_id: &'a str,
        state: WorkerState,
    },
    TaskClaimed {
        task: &'a Task,
    },
    Throttled {
        task_id: &'a TaskId,
        waited: Duration,
    },
    TaskCompleted {
        task_id: &'a TaskId,
        elapsed: Duration,
    },
    TaskFailed {
        task_id: &'a TaskId,
        error: &'a str,
        next_state: Option<TaskState>,
    },
    StoreError {
        operation: &'static str,
        error: &'a AppError,
    },
    Stopped {
        worker_id: &'a str,
        summary: &'a WorkerSummary,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::StateChanged { worker_id, state } => {
                tracing::debug!(%worker_id, %state, "Worker state changed");
            }
            WorkerEvent::TaskClaimed { task } => {
                tracing::info!(task_id = %task.id, attempt = task.attempts, "Task claimed");
            }
            WorkerEvent::Throttled { task_id, waited } => {
                tracing::debug!(%task_id, waited_ms = %waited.as_millis(), "Rate limited");
            }
            WorkerEvent::TaskCompleted { task_id, elapsed } => {
                tracing::info!(%task_id, elapsed_ms = %elapsed.as_millis(), "Task completed");
            }
            WorkerEvent::TaskFailed {
                task_id,
                error,
                next_state,
            } => {
                tracing::warn!(%task_id, %error, ?next_state, "Task failed");
            }
            WorkerEvent::StoreError { operation, error } => {
                tracing::error!(%operation, %error, "Store unavailable, backing off");
            }
            WorkerEvent::Stopped { worker_id, summary } => {
                tracing::info!(
                    %worker_id,
                    processed = summary.processed,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    stop_reason = ?summary.stop_reason,
                    "Worker stopped"
                );
            }
        }
    }
}

/// Next idle back-off step: double, capped at `max`.
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Claims tasks one at a time, throttles, processes and acknowledges them.
pub struct WorkerService<S, P, R>
where
    S: QueueStore + RateLimitStore + HeartbeatStore,
    P: Processor,
    R: ResultStore,
{
    manager: TaskManager<S>,
    limiter: RateLimiter<S>,
    processor: P,
    results: R,
    config: WorkerConfig,
}

impl<S, P, R> WorkerService<S, P, R>
where
    S: QueueStore + RateLimitStore + HeartbeatStore,
    P: Processor,
    R: ResultStore,
{
    pub fn new(
        manager: TaskManager<S>,
        limiter: RateLimiter<S>,
        processor: P,
        results: R,
        config: WorkerConfig,
    ) -> Self {
        Self {
            manager,
            limiter,
            processor,
            results,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker loop until `max_tasks`, the idle timeout, or cancellation.
    ///
    /// Cancellation is only observed between tasks; a task in flight is
    /// always acknowledged first.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> WorkerSummary {
        let worker_id = self.config.worker_id.as_str();
        let mut heartbeat = WorkerHeartbeat::new(worker_id, self.manager.clock().now());
        self.beat(&mut heartbeat).await;
        reporter.report(WorkerEvent::Started { worker_id });

        let mut processed = 0u64;
        let mut idle_since: Option<Instant> = None;
        let mut backoff = self.config.poll_interval;

        self.transition(&mut heartbeat, WorkerState::Running, reporter);
        let stop_reason = loop {
            if cancel_token.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.config.max_tasks.is_some_and(|max| processed >= max) {
                break StopReason::MaxTasks;
            }
            self.beat(&mut heartbeat).await;

            let claimed = match self.manager.claim(worker_id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    reporter.report(WorkerEvent::StoreError {
                        operation: "claim",
                        error: &e,
                    });
                    if self
                        .pause(self.config.store_retry_backoff, &cancel_token)
                        .await
                    {
                        continue;
                    }
                    break StopReason::Cancelled;
                }
            };

            let Some(task) = claimed else {
                let since = *idle_since.get_or_insert_with(Instant::now);
                let idle_for = since.elapsed();
                if idle_for >= self.config.idle_timeout {
                    break StopReason::IdleTimeout;
                }
                self.transition(&mut heartbeat, WorkerState::IdleWait, reporter);
                self.beat(&mut heartbeat).await;

                let wait = backoff.min(self.config.idle_timeout - idle_for);
                if !self.pause(wait, &cancel_token).await {
                    break StopReason::Cancelled;
                }
                backoff = next_backoff(backoff, self.config.max_poll_interval);
                continue;
            };

            idle_since = None;
            backoff = self.config.poll_interval;
            self.transition(&mut heartbeat, WorkerState::Running, reporter);
            reporter.report(WorkerEvent::TaskClaimed { task: &task });

            heartbeat.current_task = Some(task.id.clone());
            self.beat(&mut heartbeat).await;

            if self.process_task(&task, &cancel_token, reporter).await {
                heartbeat.tasks_done += 1;
            } else {
                heartbeat.tasks_failed += 1;
            }
            heartbeat.current_task = None;
            processed += 1;
        };

        let summary = WorkerSummary {
            processed,
            succeeded: heartbeat.tasks_done,
            failed: heartbeat.tasks_failed,
            stop_reason,
        };
        self.transition(&mut heartbeat, WorkerState::Stopped, reporter);
        self.beat(&mut heartbeat).await;
        reporter.report(WorkerEvent::Stopped {
            worker_id,
            summary: &summary,
        });
        summary
    }

    /// Throttle, process, persist and acknowledge one claimed task.
    /// Returns whether the attempt succeeded.
    async fn process_task<WR: WorkerReporter>(
        &self,
        task: &Task,
        cancel_token: &CancellationToken,
        reporter: &WR,
    ) -> bool {
        let waited = self.limiter.acquire().await;
        if !waited.is_zero() {
            reporter.report(WorkerEvent::Throttled {
                task_id: &task.id,
                waited,
            });
        }

        let started = Instant::now();
        let outcome = match self.processor.process(task).await {
            Ok(outcome) => self
                .results
                .upsert_result(&task.id, &self.config.worker_id, &outcome.fields)
                .await
                .map_err(|e| AppError::transient(format!("Failed to persist result: {e}"))),
            Err(e) => Err(e),
        };

        let manager = &self.manager;
        match outcome {
            Ok(()) => {
                self.acknowledge("ack_success", cancel_token, reporter, move || {
                    manager.ack_success(&task.id)
                })
                .await;
                reporter.report(WorkerEvent::TaskCompleted {
                    task_id: &task.id,
                    elapsed: started.elapsed(),
                });
                true
            }
            Err(error) => {
                let cause = &error;
                let next_state = self
                    .acknowledge("ack_failure", cancel_token, reporter, move || {
                        manager.ack_failure(&task.id, cause)
                    })
                    .await
                    .flatten();
                let message = error.to_string();
                reporter.report(WorkerEvent::TaskFailed {
                    task_id: &task.id,
                    error: &message,
                    next_state,
                });
                false
            }
        }
    }

    /// Retry an acknowledgement through store outages, up to
    /// `ack_retry_limit` retries. Any other error is not retried. `None`
    /// means it was abandoned and the lease will expire.
    async fn acknowledge<T, F, Fut, WR>(
        &self,
        operation: &'static str,
        cancel_token: &CancellationToken,
        reporter: &WR,
        ack: F,
    ) -> Option<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
        WR: WorkerReporter,
    {
        let mut retries = 0;
        loop {
            match ack().await {
                Ok(value) => return Some(value),
                Err(e) if !e.is_store_failure() => {
                    tracing::warn!(
                        worker_id = %self.config.worker_id,
                        %operation,
                        error = %e,
                        "Acknowledgement rejected; the lease will expire"
                    );
                    return None;
                }
                Err(e) => {
                    reporter.report(WorkerEvent::StoreError {
                        operation,
                        error: &e,
                    });
                    if retries >= self.config.ack_retry_limit
                        || !self
                            .pause(self.config.store_retry_backoff, cancel_token)
                            .await
                    {
                        tracing::warn!(
                            worker_id = %self.config.worker_id,
                            %operation,
                            "Giving up on acknowledgement; the lease will expire"
                        );
                        return None;
                    }
                    retries += 1;
                }
            }
        }
    }

    fn transition<WR: WorkerReporter>(
        &self,
        heartbeat: &mut WorkerHeartbeat,
        state: WorkerState,
        reporter: &WR,
    ) {
        if heartbeat.state != state {
            heartbeat.state = state;
            reporter.report(WorkerEvent::StateChanged {
                worker_id: &self.config.worker_id,
                state,
            });
        }
    }

    /// Best effort: a missed heartbeat only makes the worker look stalled.
    async fn beat(&self, heartbeat: &mut WorkerHeartbeat) {
        heartbeat.last_seen = self.manager.clock().now();
        if let Err(e) = self.manager.store().beat(heartbeat).await {
            tracing::debug!(worker_id = %heartbeat.worker_id, error = %e, "Heartbeat failed");
        }
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration, cancel_token: &CancellationToken) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = cancel_token.cancelled() => false,
        }
    }
}
