pub mod config;
pub mod database;
pub mod result_repository;
pub mod task_store;

pub use config::DatabaseConfig;
pub use database::Database;
pub use result_repository::{ResultRepository, StoredResult};
pub use task_store::PgTaskStore;
