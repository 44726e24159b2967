use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Pool, Postgres};

use dragnet_core::error::AppError;
use dragnet_core::task::TaskId;
use dragnet_core::traits::ResultStore;

use crate::task_store::db_err;

/// The latest extracted fields for one business entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredResult {
    pub business_id: String,
    pub fields: serde_json::Value,
    pub worker_id: String,
    /// How many times the row was written; above 1 means the task was redone.
    pub write_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Repository for scraped results in PostgreSQL.
#[derive(Clone)]
pub struct ResultRepository {
    pool: Pool<Postgres>,
}

impl ResultRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite the result for `business_id`.
    pub async fn upsert(
        &self,
        business_id: &str,
        worker_id: &str,
        fields: &serde_json::Value,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO task_results (business_id, fields, worker_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (business_id) DO UPDATE
            SET fields = EXCLUDED.fields,
                worker_id = EXCLUDED.worker_id,
                write_count = task_results.write_count + 1,
                updated_at = NOW()
            "#,
        )
        .bind(business_id)
        .bind(fields)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    pub async fn get_result(&self, business_id: &str) -> Result<Option<StoredResult>, AppError> {
        let row = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT business_id, fields, worker_id, write_count, created_at, updated_at
            FROM task_results
            WHERE business_id = $1
            "#,
        )
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(Into::into))
    }

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ResultRow {
    business_id: String,
    fields: serde_json::Value,
    worker_id: String,
    write_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ResultRow> for StoredResult {
    fn from(row: ResultRow) -> Self {
        StoredResult {
            business_id: row.business_id,
            fields: row.fields,
            worker_id: row.worker_id,
            write_count: row.write_count as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

// -- Trait implementation --

impl ResultStore for ResultRepository {
    async fn upsert_result(
        &self,
        business_id: &TaskId,
        worker_id: &str,
        fields: &serde_json::Value,
    ) -> Result<(), AppError> {
        self.upsert(business_id.as_str(), worker_id, fields).await
    }
}
