use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dragnet_core::monitor::WorkerStatus;
use dragnet_core::rate_limit::RateLimitPolicy;
use dragnet_core::task::{QueueCounts, Reclaimed, Task};

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct EnqueueTaskRequest {
    /// Business identifier; doubles as the task id.
    pub id: String,
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct EnqueueTaskResponse {
    pub id: String,
    /// `created`, `revived` or `duplicate`.
    pub outcome: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TaskResponse {
    pub id: String,
    pub payload: serde_json::Value,
    pub state: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id.to_string(),
            payload: task.payload,
            state: task.state.to_string(),
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            claimed_by: task.claimed_by,
            claimed_at: task.claimed_at,
            last_error: task.last_error,
            created_at: task.created_at,
            updated_at: task.updated_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListTasksQuery {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TaskListResponse {
    pub tasks: Vec<TaskResponse>,
    pub total: usize,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ReviveResponse {
    pub id: String,
    pub state: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ReclaimedTaskResponse {
    pub id: String,
    pub previous_owner: Option<String>,
    pub state: String,
}

impl From<Reclaimed> for ReclaimedTaskResponse {
    fn from(r: Reclaimed) -> Self {
        Self {
            id: r.id.to_string(),
            previous_owner: r.previous_owner,
            state: r.state.to_string(),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ReclaimResponse {
    pub reclaimed: Vec<ReclaimedTaskResponse>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Monitoring
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CountsResponse {
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    pub failed: u64,
    pub dead: u64,
    pub total: u64,
    pub outstanding: u64,
}

impl From<QueueCounts> for CountsResponse {
    fn from(c: QueueCounts) -> Self {
        Self {
            pending: c.pending,
            claimed: c.claimed,
            done: c.done,
            failed: c.failed,
            dead: c.dead,
            total: c.total(),
            outstanding: c.outstanding(),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WorkerResponse {
    pub worker_id: String,
    pub state: String,
    pub last_seen: DateTime<Utc>,
    pub tasks_done: u64,
    pub tasks_failed: u64,
    pub current_task: Option<String>,
    pub stalled: bool,
}

impl From<WorkerStatus> for WorkerResponse {
    fn from(w: WorkerStatus) -> Self {
        let hb = w.heartbeat;
        Self {
            worker_id: hb.worker_id,
            state: hb.state.to_string(),
            last_seen: hb.last_seen,
            tasks_done: hb.tasks_done,
            tasks_failed: hb.tasks_failed,
            current_task: hb.current_task.map(|id| id.to_string()),
            stalled: w.stalled,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WorkerListResponse {
    pub workers: Vec<WorkerResponse>,
    pub stalled: usize,
}

// ---------------------------------------------------------------------------
// Rate limit
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RateLimitBody {
    /// Attempts allowed per window across all workers.
    pub limit: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

impl From<RateLimitPolicy> for RateLimitBody {
    fn from(p: RateLimitPolicy) -> Self {
        Self {
            limit: p.limit,
            window_secs: p.window.as_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
