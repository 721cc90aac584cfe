//! The in-memory table of job records.
//!
//! Every access goes through a single short-held lock. No operation waits on anything else
//! while holding it.
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::{JobId, JobRecord, JobStatus, OwnerId};

#[derive(Debug, Clone, Default)]
pub(crate) struct JobRegistry {
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
}

/// The number of jobs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

impl StatusCounts {
    fn count(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
        self.total += 1;
    }
}

/// A snapshot of the coordinator's load and capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub is_running: bool,
    pub accelerator_count: usize,
    pub max_workers: usize,
    /// The global number of pending jobs, regardless of any owner filter.
    pub queue_size: usize,
    /// Per status counts, restricted to one owner when requested.
    pub tasks: StatusCounts,
}

impl JobRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, record: JobRecord) {
        self.write().insert(record.id, record);
    }

    /// A copy of the record, with the queue position hint refreshed if it is still pending.
    pub(crate) fn get(&self, id: JobId) -> Option<JobRecord> {
        let jobs = self.read();
        let mut record = jobs.get(&id)?.clone();
        if record.status == JobStatus::Pending {
            record.queue_position_hint = Self::pending_in(&jobs);
        }
        Some(record)
    }

    pub(crate) fn remove(&self, id: JobId) -> Option<JobRecord> {
        self.write().remove(&id)
    }

    /// Apply `f` to the record under the lock.
    pub(crate) fn update<T>(&self, id: JobId, f: impl FnOnce(&mut JobRecord) -> T) -> Option<T> {
        self.write().get_mut(&id).map(f)
    }

    pub(crate) fn pending_count(&self) -> usize {
        Self::pending_in(&self.read())
    }

    fn pending_in(jobs: &HashMap<JobId, JobRecord>) -> usize {
        jobs.values()
            .filter(|record| record.status == JobStatus::Pending)
            .count()
    }

    pub(crate) fn counts(&self, owner: Option<OwnerId>) -> StatusCounts {
        self.read()
            .values()
            .filter(|record| owner.is_none() || record.metadata.owner == owner)
            .fold(StatusCounts::default(), |mut counts, record| {
                counts.count(record.status);
                counts
            })
    }

    /// Remove terminal records that finished before `cutoff`, returning how many were removed.
    pub(crate) fn remove_terminal_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, record| {
            !(record.is_terminal()
                && record
                    .completed_at
                    .is_some_and(|completed_at| completed_at < cutoff))
        });
        before - jobs.len()
    }
}
