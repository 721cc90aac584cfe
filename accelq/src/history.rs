//! The durable record of past jobs.
//!
//! The coordinator writes every lifecycle transition through to a [`HistoryGateway`]. These
//! writes are best effort: a failing gateway is logged but never changes the outcome of a job.
//!
//! Implementations must make every operation idempotent and safe to call concurrently. To check
//! an implementation, run the shared suite from [`crate::history_test_suite`] against it.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobId, JobRecord, JobStatus, OwnerId};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// A persisted history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: JobId,
    pub owner: Option<OwnerId>,
    pub job_type: String,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub result_location: Option<String>,
    pub result_name: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Seconds between start and completion.
    pub execution_time: Option<f64>,
}

impl HistoryEntry {
    pub fn from_record(record: &JobRecord) -> Self {
        let update = HistoryUpdate::from_record(record);
        Self {
            job_id: record.id,
            owner: record.metadata.owner,
            job_type: record.metadata.job_type.clone(),
            prompt: record.metadata.prompt.clone(),
            negative_prompt: record.metadata.negative_prompt.clone(),
            parameters: record.metadata.parameters.clone(),
            status: update.status,
            result_location: update.result_location,
            result_name: update.result_name,
            error_message: update.error_message,
            created_at: record.created_at,
            started_at: update.started_at,
            completed_at: update.completed_at,
            execution_time: update.execution_time,
        }
    }

    /// Apply an update in place.
    ///
    /// The status is always overwritten, every other field only when the update carries a value.
    pub fn apply(&mut self, update: &HistoryUpdate) {
        self.status = update.status;
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        if update.result_location.is_some() {
            self.result_location.clone_from(&update.result_location);
        }
        if update.result_name.is_some() {
            self.result_name.clone_from(&update.result_name);
        }
        if update.error_message.is_some() {
            self.error_message.clone_from(&update.error_message);
        }
        if update.execution_time.is_some() {
            self.execution_time = update.execution_time;
        }
    }
}

/// The fields written on a status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryUpdate {
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_location: Option<String>,
    pub result_name: Option<String>,
    pub error_message: Option<String>,
    pub execution_time: Option<f64>,
}

impl HistoryUpdate {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            started_at: None,
            completed_at: None,
            result_location: None,
            result_name: None,
            error_message: None,
            execution_time: None,
        }
    }

    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            status: record.status,
            started_at: record.started_at,
            completed_at: record.completed_at,
            result_location: record
                .result
                .as_ref()
                .map(|result| result.result_location.clone()),
            result_name: record
                .result
                .as_ref()
                .map(|result| result.display_name.clone()),
            error_message: record.error.clone(),
            execution_time: record
                .execution_time()
                .map(|delta| delta.num_milliseconds() as f64 / 1000.0),
        }
    }
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Error encoding or decoding history data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("History store in bad state")]
    BadState,
    #[error("Job {0} not found in history")]
    JobNotFound(JobId),
    #[error("History store error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A durable store of job history.
#[async_trait]
pub trait HistoryGateway: Send + Sync {
    /// Insert a new row. Inserting an id that already exists leaves the existing row untouched.
    async fn insert(&self, entry: HistoryEntry) -> Result<(), HistoryError>;

    /// Apply an update to an existing row, [`HistoryError::JobNotFound`] if there is none.
    async fn update(&self, job_id: JobId, update: HistoryUpdate) -> Result<(), HistoryError>;

    async fn find_by_id(&self, job_id: JobId) -> Result<Option<HistoryEntry>, HistoryError>;
}

/// A gateway that stores nothing, used when no history is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHistory;

#[async_trait]
impl HistoryGateway for NullHistory {
    async fn insert(&self, _entry: HistoryEntry) -> Result<(), HistoryError> {
        Ok(())
    }

    async fn update(&self, _job_id: JobId, _update: HistoryUpdate) -> Result<(), HistoryError> {
        Ok(())
    }

    async fn find_by_id(&self, _job_id: JobId) -> Result<Option<HistoryEntry>, HistoryError> {
        Ok(None)
    }
}

pub(crate) async fn write_created(history: &dyn HistoryGateway, record: &JobRecord) {
    let job_id = record.id;
    let _ = history
        .insert(HistoryEntry::from_record(record))
        .await
        .inspect_err(|err| {
            tracing::error!(
                ?err,
                %job_id,
                "Failed to write history for job {job_id}, error: {err}"
            )
        });
}

pub(crate) async fn write_transition(history: &dyn HistoryGateway, record: &JobRecord) {
    let job_id = record.id;
    let status = record.status;
    let _ = history
        .update(job_id, HistoryUpdate::from_record(record))
        .await
        .inspect_err(|err| {
            tracing::error!(
                ?err,
                %job_id,
                %status,
                "Failed to write {status} history for job {job_id}, error: {err}"
            )
        });
}
