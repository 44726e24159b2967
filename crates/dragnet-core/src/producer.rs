use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::manager::TaskManager;
use crate::store::QueueStore;
use crate::task::{Enqueued, NewTask};

/// One business entity to be scraped: its key and the payload the
/// processor will receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: String,
    pub payload: serde_json::Value,
}

impl Entity {
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// Tally of one [`TaskManager::enqueue_batch`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub submitted: u64,
    pub created: u64,
    pub revived: u64,
    pub duplicates: u64,
    /// Entities that failed validation and were skipped.
    pub rejected: u64,
    pub batches: u64,
}

impl BatchSummary {
    pub fn enqueued(&self) -> u64 {
        self.created + self.revived
    }

    fn record(&mut self, outcome: Enqueued) {
        match outcome {
            Enqueued::Created => self.created += 1,
            Enqueued::Revived => self.revived += 1,
            Enqueued::Duplicate => self.duplicates += 1,
        }
    }
}

impl<S: QueueStore> TaskManager<S> {
    /// Enqueue a stream of entities, reporting progress every `batch_size`.
    ///
    /// Invalid entities are logged and counted in `rejected`; a store error
    /// aborts the run. Entities already processed stay enqueued, and rerunning
    /// the same input is safe because enqueue is idempotent.
    pub async fn enqueue_batch<I>(
        &self,
        entities: I,
        batch_size: usize,
    ) -> Result<BatchSummary, AppError>
    where
        I: IntoIterator<Item = Entity>,
    {
        let batch_size = batch_size.max(1);
        let mut summary = BatchSummary::default();
        let mut in_batch = 0usize;

        for entity in entities {
            summary.submitted += 1;
            let task = match NewTask::new(&entity.key, entity.payload) {
                Ok(task) => task,
                Err(e) => {
                    summary.rejected += 1;
                    tracing::warn!(key = %entity.key, error = %e, "Skipping invalid entity");
                    continue;
                }
            };

            match self.submit(task).await {
                Ok(outcome) => summary.record(outcome),
                Err(AppError::Validation(msg)) => {
                    summary.rejected += 1;
                    tracing::warn!(key = %entity.key, error = %msg, "Skipping invalid entity");
                }
                Err(e) => return Err(e),
            }

            in_batch += 1;
            if in_batch == batch_size {
                summary.batches += 1;
                in_batch = 0;
                tracing::info!(
                    batch = summary.batches,
                    submitted = summary.submitted,
                    enqueued = summary.enqueued(),
                    duplicates = summary.duplicates,
                    "Batch enqueued"
                );
            }
        }

        if in_batch > 0 {
            summary.batches += 1;
        }
        tracing::info!(
            submitted = summary.submitted,
            created = summary.created,
            revived = summary.revived,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            batches = summary.batches,
            "Enqueue finished"
        );
        Ok(summary)
    }
}
