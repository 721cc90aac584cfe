use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use uuid::Uuid;

use accelq::history::HistoryEntry;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "accelq_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<JobStatus> for accelq::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => Self::Pending,
            JobStatus::Running => Self::Running,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<accelq::job::JobStatus> for JobStatus {
    fn from(value: accelq::job::JobStatus) -> Self {
        match value {
            accelq::job::JobStatus::Pending => Self::Pending,
            accelq::job::JobStatus::Running => Self::Running,
            accelq::job::JobStatus::Completed => Self::Completed,
            accelq::job::JobStatus::Failed => Self::Failed,
            accelq::job::JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct HistoryRow {
    pub job_id: Uuid,
    pub owner_id: Option<i64>,
    pub job_type: String,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub result_path: Option<String>,
    pub result_filename: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time: Option<f64>,
}

impl From<HistoryRow> for HistoryEntry {
    fn from(value: HistoryRow) -> Self {
        Self {
            job_id: value.job_id.into(),
            owner: value.owner_id,
            job_type: value.job_type,
            prompt: value.prompt,
            negative_prompt: value.negative_prompt,
            parameters: value.parameters,
            status: value.status.into(),
            result_location: value.result_path,
            result_name: value.result_filename,
            error_message: value.error_message,
            created_at: value.created_at,
            started_at: value.started_at,
            completed_at: value.completed_at,
            execution_time: value.execution_time,
        }
    }
}
