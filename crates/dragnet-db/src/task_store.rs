use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};

use dragnet_core::error::AppError;
use dragnet_core::rate_limit::{RateLimitPolicy, Reservation, gcra_reserve};
use dragnet_core::store::{HeartbeatStore, QueueStore, RateLimitStore};
use dragnet_core::task::{Enqueued, NewTask, QueueCounts, Reclaimed, Task, TaskId, TaskState};
use dragnet_core::worker::WorkerHeartbeat;

/// PostgreSQL-backed task store. Claims use `SELECT FOR UPDATE SKIP LOCKED`;
/// every other transition is a single conditional `UPDATE`.
#[derive(Clone)]
pub struct PgTaskStore {
    pool: Pool<Postgres>,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Connection-level failures mean the store is unreachable; everything
/// else is a query problem.
pub(crate) fn db_err(e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => AppError::StoreUnavailable(e.to_string()),
        other => AppError::DatabaseError(other.to_string()),
    }
}

// -- Internal row types for sqlx deserialization --

const TASK_COLUMNS: &str = "id, payload, state, attempts, max_attempts, claimed_by, claimed_at, \
                            last_error, created_at, updated_at, completed_at";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    payload: serde_json::Value,
    state: String,
    attempts: i32,
    max_attempts: i32,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self, AppError> {
        Ok(Task {
            id: TaskId::new(&row.id)
                .map_err(|e| AppError::DatabaseError(format!("Corrupt task id '{}': {e}", row.id)))?,
            payload: row.payload,
            state: row.state.parse().map_err(AppError::DatabaseError)?,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HeartbeatRow {
    worker_id: String,
    state: String,
    last_seen: DateTime<Utc>,
    tasks_done: i64,
    tasks_failed: i64,
    current_task: Option<String>,
}

impl TryFrom<HeartbeatRow> for WorkerHeartbeat {
    type Error = AppError;

    fn try_from(row: HeartbeatRow) -> Result<Self, AppError> {
        Ok(WorkerHeartbeat {
            worker_id: row.worker_id,
            state: row.state.parse().map_err(AppError::DatabaseError)?,
            last_seen: row.last_seen,
            tasks_done: row.tasks_done as u64,
            tasks_failed: row.tasks_failed as u64,
            current_task: row.current_task.and_then(|id| TaskId::new(id).ok()),
        })
    }
}

fn parse_state(raw: &str) -> Result<TaskState, AppError> {
    raw.parse().map_err(AppError::DatabaseError)
}

/// Attempt counts live in `INTEGER` columns.
fn attempts_param(n: u32) -> Result<i32, AppError> {
    i32::try_from(n).map_err(|_| AppError::Validation(format!("attempt count {n} out of range")))
}

impl QueueStore for PgTaskStore {
    async fn insert(
        &self,
        task: NewTask,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, AppError> {
        // `xmax = 0` only for a freshly inserted row; the conflict branch
        // revives FAILED/DEAD rows and leaves every other state untouched.
        let row: Option<(bool,)> = sqlx::query_as(
            r#"
            INSERT INTO tasks (id, payload, state, attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, 'pending', 0, $3, $4, $4)
            ON CONFLICT (id) DO UPDATE
            SET payload = EXCLUDED.payload,
                state = 'pending',
                max_attempts = tasks.attempts + $3,
                claimed_by = NULL,
                claimed_at = NULL,
                last_error = NULL,
                completed_at = NULL,
                queue_seq = nextval('task_queue_seq'),
                updated_at = $4
            WHERE tasks.state IN ('failed', 'dead')
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(task.id.as_str())
        .bind(&task.payload)
        .bind(attempts_param(max_attempts)?)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(match row {
            Some((true,)) => Enqueued::Created,
            Some((false,)) => Enqueued::Revived,
            None => Enqueued::Duplicate,
        })
    }

    async fn claim(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Task>, AppError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            r#"
            UPDATE tasks
            SET state = 'claimed', claimed_by = $1, claimed_at = $2,
                attempts = attempts + 1, updated_at = $2
            WHERE id = (
                SELECT id FROM tasks
                WHERE state = 'pending'
                ORDER BY queue_seq
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Task::try_from).transpose()
    }

    async fn complete(&self, task_id: &TaskId, now: DateTime<Utc>) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'done', claimed_by = NULL, claimed_at = NULL,
                completed_at = $2, updated_at = $2
            WHERE id = $1 AND state = 'claimed'
            "#,
        )
        .bind(task_id.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        task_id: &TaskId,
        error: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskState>, AppError> {
        // SET expressions see the pre-update row, so every CASE agrees.
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET state = CASE
                    WHEN NOT $3::boolean THEN 'failed'
                    WHEN attempts < max_attempts THEN 'pending'
                    ELSE 'dead'
                END,
                queue_seq = CASE
                    WHEN $3::boolean AND attempts < max_attempts THEN nextval('task_queue_seq')
                    ELSE queue_seq
                END,
                completed_at = CASE
                    WHEN $3::boolean AND attempts < max_attempts THEN NULL
                    ELSE $4
                END,
                last_error = $2,
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $4
            WHERE id = $1 AND state = 'claimed'
            RETURNING state
            "#,
        )
        .bind(task_id.as_str())
        .bind(error)
        .bind(retryable)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|(state,)| parse_state(&state)).transpose()
    }

    async fn reclaim(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reclaimed>, AppError> {
        let rows: Vec<(String, Option<String>, String)> = sqlx::query_as(
            r#"
            WITH expired AS (
                SELECT id, claimed_by, claimed_at FROM tasks
                WHERE state = 'claimed' AND claimed_at <= $1
                ORDER BY claimed_at
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks t
            SET state = 'pending',
                queue_seq = nextval('task_queue_seq'),
                completed_at = NULL,
                last_error = 'lease held by ' || COALESCE(e.claimed_by, 'unknown worker') || ' expired',
                claimed_by = NULL,
                claimed_at = NULL,
                updated_at = $2
            FROM expired e
            WHERE t.id = e.id
            RETURNING t.id, e.claimed_by, t.state
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter()
            .map(|(id, previous_owner, state)| -> Result<Reclaimed, AppError> {
                Ok(Reclaimed {
                    id: TaskId::new(&id)?,
                    previous_owner,
                    state: parse_state(&state)?,
                })
            })
            .collect()
    }

    async fn revive(
        &self,
        task_id: &TaskId,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'pending', max_attempts = attempts + $2,
                claimed_by = NULL, claimed_at = NULL, completed_at = NULL,
                queue_seq = nextval('task_queue_seq'), updated_at = $3
            WHERE id = $1 AND state IN ('failed', 'dead')
            "#,
        )
        .bind(task_id.as_str())
        .bind(attempts_param(extra_attempts)?)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn revive_all(
        &self,
        state: TaskState,
        extra_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        if !state.is_revivable() {
            return Err(AppError::Validation(format!(
                "only failed or dead tasks can be revived, not {state}"
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET state = 'pending', max_attempts = attempts + $2,
                claimed_by = NULL, claimed_at = NULL, completed_at = NULL,
                queue_seq = nextval('task_queue_seq'), updated_at = $3
            WHERE state = $1
            "#,
        )
        .bind(state.as_str())
        .bind(attempts_param(extra_attempts)?)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<Task>, AppError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"
        ))
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(Task::try_from).transpose()
    }

    async fn list(&self, state: Option<TaskState>, limit: usize) -> Result<Vec<Task>, AppError> {
        let rows = match state {
            Some(TaskState::Pending) => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM tasks
                    WHERE state = 'pending'
                    ORDER BY queue_seq
                    LIMIT $1
                    "#
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            Some(state) => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM tasks
                    WHERE state = $1
                    ORDER BY updated_at DESC, id
                    LIMIT $2
                    "#
                ))
                .bind(state.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, TaskRow>(&format!(
                    r#"
                    SELECT {TASK_COLUMNS} FROM tasks
                    ORDER BY updated_at DESC, id
                    LIMIT $1
                    "#
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        rows.into_iter().map(Task::try_from).collect()
    }

    async fn counts(&self) -> Result<QueueCounts, AppError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as(r#"SELECT state, COUNT(*) FROM tasks GROUP BY state"#)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        let mut counts = QueueCounts::default();
        for (state, n) in rows {
            counts.add(parse_state(&state)?, n as u64);
        }
        Ok(counts)
    }

    async fn purge(&self) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM tasks")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

impl RateLimitStore for PgTaskStore {
    async fn load_policy(&self, key: &str) -> Result<Option<RateLimitPolicy>, AppError> {
        let row: Option<(Option<i32>, Option<i64>)> =
            sqlx::query_as(r#"SELECT max_requests, window_ms FROM rate_limits WHERE key = $1"#)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

        match row {
            Some((Some(limit), Some(window_ms))) => Ok(Some(RateLimitPolicy::new(
                limit as u32,
                Duration::from_millis(window_ms as u64),
            )?)),
            _ => Ok(None),
        }
    }

    async fn save_policy(&self, key: &str, policy: RateLimitPolicy) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO rate_limits (key, max_requests, window_ms, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (key) DO UPDATE
            SET max_requests = EXCLUDED.max_requests,
                window_ms = EXCLUDED.window_ms,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(policy.limit as i32)
        .bind(policy.window.as_millis() as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn reserve(
        &self,
        key: &str,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Reservation, AppError> {
        sqlx::query(r#"INSERT INTO rate_limits (key) VALUES ($1) ON CONFLICT (key) DO NOTHING"#)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        // The row lock serialises every worker drawing on this key.
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (tat,): (Option<DateTime<Utc>>,) =
            sqlx::query_as(r#"SELECT tat FROM rate_limits WHERE key = $1 FOR UPDATE"#)
                .bind(key)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?;

        let (decision, next) = gcra_reserve(tat, policy, now);
        if let Some(next) = next {
            sqlx::query(r#"UPDATE rate_limits SET tat = $2, updated_at = $3 WHERE key = $1"#)
                .bind(key)
                .bind(next)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(decision)
    }
}

impl HeartbeatStore for PgTaskStore {
    async fn beat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats
                (worker_id, state, last_seen, tasks_done, tasks_failed, current_task)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (worker_id) DO UPDATE
            SET state = EXCLUDED.state,
                last_seen = EXCLUDED.last_seen,
                tasks_done = EXCLUDED.tasks_done,
                tasks_failed = EXCLUDED.tasks_failed,
                current_task = EXCLUDED.current_task
            "#,
        )
        .bind(&heartbeat.worker_id)
        .bind(heartbeat.state.as_str())
        .bind(heartbeat.last_seen)
        .bind(heartbeat.tasks_done as i64)
        .bind(heartbeat.tasks_failed as i64)
        .bind(heartbeat.current_task.as_ref().map(TaskId::as_str))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, AppError> {
        let rows = sqlx::query_as::<_, HeartbeatRow>(
            r#"
            SELECT worker_id, state, last_seen, tasks_done, tasks_failed, current_task
            FROM worker_heartbeats
            ORDER BY worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.into_iter().map(WorkerHeartbeat::try_from).collect()
    }
}
