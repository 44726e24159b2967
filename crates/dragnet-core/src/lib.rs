pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod memory;
pub mod monitor;
pub mod producer;
pub mod rate_limit;
pub mod store;
pub mod task;
pub mod traits;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use error::AppError;
pub use manager::TaskManager;
pub use store::{HeartbeatStore, QueueStore, RateLimitStore};
pub use task::{Enqueued, NewTask, QueueCounts, Task, TaskId, TaskState};
pub use traits::{ProcessOutcome, Processor, ResultStore};
