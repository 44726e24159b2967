use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::task::{Task, TaskId};

/// Fields extracted for one business entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub fields: serde_json::Value,
}

impl ProcessOutcome {
    pub fn new(fields: serde_json::Value) -> Self {
        Self { fields }
    }
}

/// Does the actual scraping work for one task.
///
/// Return a retryable [`AppError`] for transient trouble (timeouts, 5xx,
/// throttling) and a non-retryable one when the payload can never succeed.
pub trait Processor: Send + Sync + Clone {
    fn process(&self, task: &Task) -> impl Future<Output = Result<ProcessOutcome, AppError>> + Send;
}

/// Persists extraction results, keyed by business id.
///
/// Writes must be idempotent: a task whose lease expired may be processed
/// twice and upserted twice.
pub trait ResultStore: Send + Sync + Clone {
    fn upsert_result(
        &self,
        business_id: &TaskId,
        worker_id: &str,
        fields: &serde_json::Value,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}
