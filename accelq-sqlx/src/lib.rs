//! A PostgreSQL backed [`HistoryGateway`] for `accelq`.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use accelq::prelude::*;
//! use accelq_sqlx::PgHistory;
//!
//! let pool = sqlx::PgPool::connect("postgres://localhost/accelq").await?;
//! let history = PgHistory::from(pool);
//! history.run_migrations().await?;
//!
//! let coordinator = Coordinator::new(CoordinatorConfig::default()).with_history(history);
//! # Ok(())
//! # }
//! ```
use std::ops::Deref;

use accelq::{
    history::{HistoryEntry, HistoryError, HistoryGateway, HistoryUpdate},
    job::JobId,
};
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

mod types;

use types::*;

/// Job history stored in the `accelq_job_history` table.
#[derive(Clone, Debug)]
pub struct PgHistory {
    pool: PgPool,
}

impl Deref for PgHistory {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgHistory {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgHistory {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

fn map_err(error: sqlx::Error) -> HistoryError {
    match error {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            tracing::error!(?error, "Failed to decode history row: {error}");
            HistoryError::BadState
        }
        error => HistoryError::Database(Box::new(error)),
    }
}

impl PgHistory {
    /// Create the history table if it does not exist yet.
    pub async fn run_migrations(&self) -> Result<(), HistoryError> {
        tracing::info!("Running accelq history migrations");
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|err| HistoryError::Database(Box::new(err)))
    }

    async fn insert_entry(&self, entry: HistoryEntry) -> sqlx::Result<()> {
        sqlx::query(
            r#"INSERT INTO accelq_job_history (
                job_id,
                owner_id,
                job_type,
                prompt,
                negative_prompt,
                parameters,
                status,
                result_path,
                result_filename,
                error_message,
                created_at,
                started_at,
                completed_at,
                execution_time
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (job_id) DO NOTHING"#,
        )
        .bind(Uuid::from(entry.job_id))
        .bind(entry.owner)
        .bind(entry.job_type)
        .bind(entry.prompt)
        .bind(entry.negative_prompt)
        .bind(entry.parameters)
        .bind(JobStatus::from(entry.status))
        .bind(entry.result_location)
        .bind(entry.result_name)
        .bind(entry.error_message)
        .bind(entry.created_at)
        .bind(entry.started_at)
        .bind(entry.completed_at)
        .bind(entry.execution_time)
        .execute(self.deref())
        .await?;
        Ok(())
    }

    async fn update_entry(&self, job_id: JobId, update: HistoryUpdate) -> sqlx::Result<u64> {
        let result = sqlx::query(
            r#"UPDATE accelq_job_history
            SET
                status = $2,
                started_at = COALESCE($3, started_at),
                completed_at = COALESCE($4, completed_at),
                result_path = COALESCE($5, result_path),
                result_filename = COALESCE($6, result_filename),
                error_message = COALESCE($7, error_message),
                execution_time = COALESCE($8, execution_time)
            WHERE job_id = $1"#,
        )
        .bind(Uuid::from(job_id))
        .bind(JobStatus::from(update.status))
        .bind(update.started_at)
        .bind(update.completed_at)
        .bind(update.result_location)
        .bind(update.result_name)
        .bind(update.error_message)
        .bind(update.execution_time)
        .execute(self.deref())
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_entry(&self, job_id: JobId) -> sqlx::Result<Option<HistoryRow>> {
        sqlx::query_as::<_, HistoryRow>(
            r#"SELECT
                job_id,
                owner_id,
                job_type,
                prompt,
                negative_prompt,
                parameters,
                status,
                result_path,
                result_filename,
                error_message,
                created_at,
                started_at,
                completed_at,
                execution_time
            FROM accelq_job_history
            WHERE job_id = $1"#,
        )
        .bind(Uuid::from(job_id))
        .fetch_optional(self.deref())
        .await
    }
}

#[async_trait]
impl HistoryGateway for PgHistory {
    #[instrument(skip(self, entry), fields(job_id = %entry.job_id))]
    async fn insert(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        self.insert_entry(entry).await.map_err(map_err)
    }

    #[instrument(skip(self, update), fields(status = %update.status))]
    async fn update(&self, job_id: JobId, update: HistoryUpdate) -> Result<(), HistoryError> {
        match self.update_entry(job_id, update).await.map_err(map_err)? {
            0 => Err(HistoryError::JobNotFound(job_id)),
            _ => Ok(()),
        }
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, job_id: JobId) -> Result<Option<HistoryEntry>, HistoryError> {
        Ok(self
            .load_entry(job_id)
            .await
            .map_err(map_err)?
            .map(HistoryEntry::from))
    }
}

#[cfg(all(test, feature = "pg-tests"))]
mod test {
    use sqlx::PgPool;

    use super::*;

    accelq::history_test_suite!(
        attr: sqlx::test,
        args: (pool: PgPool),
        gateway: PgHistory::from(pool)
    );

    #[sqlx::test]
    async fn update_writes_through_partial_fields(pool: PgPool) {
        let history = PgHistory::from(pool);
        let entry = accelq::history::testing::sample_entry();
        history.insert(entry.clone()).await.unwrap();

        history
            .update(
                entry.job_id,
                HistoryUpdate::new(accelq::job::JobStatus::Cancelled),
            )
            .await
            .unwrap();

        let found = history.find_by_id(entry.job_id).await.unwrap().unwrap();
        assert_eq!(found.status, accelq::job::JobStatus::Cancelled);
        assert_eq!(found.prompt, entry.prompt);
        assert_eq!(found.parameters, entry.parameters);
    }
}
