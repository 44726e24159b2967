use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Longest business key accepted as a task id.
pub const MAX_TASK_ID_LEN: usize = 128;

/// Default retry ceiling for new tasks.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Highest retry ceiling a task may carry.
pub const MAX_ATTEMPTS_LIMIT: u32 = 1_000;

/// Stable task identifier derived from the business key of the source entity.
///
/// Re-enqueueing the same entity yields the same id, which is what makes
/// enqueue idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Validate and wrap a business key.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, AppError> {
        let key = raw.as_ref().trim();
        if key.is_empty() {
            return Err(AppError::Validation("task id must not be empty".into()));
        }
        if key.len() > MAX_TASK_ID_LEN {
            return Err(AppError::Validation(format!(
                "task id longer than {MAX_TASK_ID_LEN} characters"
            )));
        }
        if let Some(bad) = key
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | '/')))
        {
            return Err(AppError::Validation(format!(
                "task id '{key}' contains invalid character {bad:?}"
            )));
        }
        Ok(Self(key.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for TaskId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskId::new(s)
    }
}

impl TryFrom<String> for TaskId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TaskId::new(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

/// Lifecycle state of a task. A task is in exactly one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Claimed,
    Done,
    /// Rejected by the processor with a non-retryable error.
    Failed,
    /// Retry budget exhausted.
    Dead,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Claimed,
        TaskState::Done,
        TaskState::Failed,
        TaskState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Claimed => "claimed",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Dead)
    }

    /// States an operator may revive back into the pending queue.
    pub fn is_revivable(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Dead)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskState::Pending),
            "claimed" => Ok(TaskState::Claimed),
            "done" => Ok(TaskState::Done),
            "failed" => Ok(TaskState::Failed),
            "dead" => Ok(TaskState::Dead),
            _ => Err(format!("Unknown task state: {}", s)),
        }
    }
}

/// A unit of scraping work plus its lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: serde_json::Value,
    pub state: TaskState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh pending task.
    pub fn pending(
        id: TaskId,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payload,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// State a claimed task moves to when its attempt fails.
    pub fn state_after_failure(&self, retryable: bool) -> TaskState {
        if !retryable {
            TaskState::Failed
        } else if self.can_retry() {
            TaskState::Pending
        } else {
            TaskState::Dead
        }
    }

    /// True once `now` is at or past `claimed_at + lease_timeout`.
    pub fn lease_expired(&self, lease_timeout: TimeDelta, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Claimed
            && self
                .claimed_at
                .is_some_and(|claimed_at| claimed_at + lease_timeout <= now)
    }
}

/// Producer-side description of a task to enqueue.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
}

impl NewTask {
    /// Build a task from a raw business key and payload, validating both.
    pub fn new(key: impl AsRef<str>, payload: serde_json::Value) -> Result<Self, AppError> {
        let id = TaskId::new(key)?;
        validate_payload(&payload)?;
        Ok(Self {
            id,
            payload,
            max_attempts: None,
        })
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

/// Reject payloads that carry nothing for the processor to work on.
pub fn validate_payload(payload: &serde_json::Value) -> Result<(), AppError> {
    use serde_json::Value;

    let empty = match payload {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    };
    if empty {
        return Err(AppError::Validation("task payload must not be empty".into()));
    }
    Ok(())
}

/// Check a retry ceiling is within `1..=MAX_ATTEMPTS_LIMIT`.
pub fn validate_max_attempts(max_attempts: u32) -> Result<u32, AppError> {
    if max_attempts == 0 {
        return Err(AppError::Validation("max_attempts must be at least 1".into()));
    }
    if max_attempts > MAX_ATTEMPTS_LIMIT {
        return Err(AppError::Validation(format!(
            "max_attempts must be at most {MAX_ATTEMPTS_LIMIT}, got {max_attempts}"
        )));
    }
    Ok(max_attempts)
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Enqueued {
    /// A new task was inserted into PENDING.
    Created,
    /// A FAILED or DEAD task with this id went back to PENDING.
    Revived,
    /// The id is already PENDING, CLAIMED or DONE; nothing changed.
    Duplicate,
}

impl Enqueued {
    /// Whether the call put the task into PENDING.
    pub fn is_new(&self) -> bool {
        !matches!(self, Enqueued::Duplicate)
    }
}

/// A task moved out of CLAIMED by lease-expiry reclamation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reclaimed {
    pub id: TaskId,
    pub previous_owner: Option<String>,
    pub state: TaskState,
}

/// Point-in-time count of tasks per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    pub failed: u64,
    pub dead: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.done + self.failed + self.dead
    }

    /// Tasks that still need a worker.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.claimed
    }

    /// Tasks that reached a terminal state.
    pub fn finished(&self) -> u64 {
        self.done + self.failed + self.dead
    }

    pub fn get(&self, state: TaskState) -> u64 {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Claimed => self.claimed,
            TaskState::Done => self.done,
            TaskState::Failed => self.failed,
            TaskState::Dead => self.dead,
        }
    }

    pub fn add(&mut self, state: TaskState, n: u64) {
        match state {
            TaskState::Pending => self.pending += n,
            TaskState::Claimed => self.claimed += n,
            TaskState::Done => self.done += n,
            TaskState::Failed => self.failed += n,
            TaskState::Dead => self.dead += n,
        }
    }
}
