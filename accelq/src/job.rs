//! The job record and its lifecycle.
//!
//! Every submitted job is tracked by a [`JobRecord`] which moves through the following states:
//!
//! ```text
//! Pending ──► Running ──► Completed
//!    │            └─────► Failed
//!    └──────► Cancelled
//! ```
//!
//! Once a job reaches one of the terminal states ([`JobStatus::Completed`],
//! [`JobStatus::Failed`], or [`JobStatus::Cancelled`]) its status never changes again.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub(crate) mod work_item;

/// The identifier of the user owning a job.
pub type OwnerId = i64;

/// The unique identifier of a submitted job.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle state of a job.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue for a worker.
    Pending,
    /// Currently being executed on an accelerator.
    Running,
    /// Finished successfully, the record carries a [`ResultPayload`].
    Completed,
    /// Finished with an error, the record carries an error message.
    Failed,
    /// Cancelled before it started running.
    Cancelled,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Whether this is a final state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub const fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_owned()))
    }
}

/// The output of a successful compute routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Where the produced artifact was stored, typically a file path.
    pub result_location: String,
    /// The media type of the artifact, e.g. `image/png`.
    pub media_kind: String,
    /// A human friendly name for the artifact, typically the file name.
    pub display_name: String,
}

impl ResultPayload {
    pub fn new(
        result_location: impl Into<String>,
        media_kind: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            result_location: result_location.into(),
            media_kind: media_kind.into(),
            display_name: display_name.into(),
        }
    }
}

/// Descriptive data carried with a job for persistence and display.
///
/// The coordinator never interprets these fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// The job type tag, e.g. `text_to_image`.
    pub job_type: String,
    pub owner: Option<OwnerId>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
}

impl JobMetadata {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    pub fn with_owner(self, owner: OwnerId) -> Self {
        Self {
            owner: Some(owner),
            ..self
        }
    }

    pub fn with_parameters(self, parameters: serde_json::Value) -> Self {
        Self { parameters, ..self }
    }

    pub fn with_prompt(self, prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..self
        }
    }

    pub fn with_negative_prompt(self, negative_prompt: impl Into<String>) -> Self {
        Self {
            negative_prompt: Some(negative_prompt.into()),
            ..self
        }
    }
}

/// Returned when a status change is not permitted by the job state machine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Job {job_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// The lifecycle state of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Present if and only if the job completed.
    pub result: Option<ResultPayload>,
    /// Present if and only if the job failed.
    pub error: Option<String>,
    /// The number of pending jobs at the last observation.
    ///
    /// This is an approximation of how busy the queue is, **not** the rank of this job within
    /// the queue.
    pub queue_position_hint: usize,
    pub metadata: JobMetadata,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, metadata: JobMetadata, queue_position_hint: usize) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            queue_position_hint,
            metadata,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The time spent waiting in the queue, if the job has started.
    pub fn wait_time(&self) -> Option<TimeDelta> {
        self.started_at.map(|started_at| started_at - self.created_at)
    }

    /// The time spent executing, if the job has both started and finished.
    pub fn execution_time(&self) -> Option<TimeDelta> {
        self.started_at
            .zip(self.completed_at)
            .map(|(started_at, completed_at)| completed_at - started_at)
    }

    pub(crate) fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(Utc::now().max(self.created_at));
        Ok(())
    }

    pub(crate) fn mark_completed(&mut self, result: ResultPayload) -> Result<(), TransitionError> {
        self.transition(JobStatus::Completed)?;
        self.result = Some(result);
        self.mark_finished();
        Ok(())
    }

    pub(crate) fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error.into());
        self.mark_finished();
        Ok(())
    }

    pub(crate) fn mark_cancelled(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Cancelled)?;
        self.mark_finished();
        Ok(())
    }

    fn mark_finished(&mut self) {
        let floor = self.started_at.unwrap_or(self.created_at);
        self.completed_at = Some(Utc::now().max(floor));
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                job_id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}
