//! Provides an in memory implementation of [`HistoryGateway`].
//!
//! It keeps every row for the lifetime of the process. Useful for tests and for running the
//! coordinator without a database, it is not durable.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::job::JobId;

use super::{HistoryEntry, HistoryError, HistoryGateway, HistoryUpdate};

/// An in memory implementation of [`HistoryGateway`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistory {
    entries: Arc<RwLock<HashMap<JobId, HistoryEntry>>>,
}

impl InMemoryHistory {
    /// Creates a new instance of [`InMemoryHistory`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every stored row, in no particular order.
    pub fn entries(&self) -> Result<Vec<HistoryEntry>, HistoryError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| HistoryError::BadState)?
            .values()
            .cloned()
            .collect())
    }
}

#[async_trait]
impl HistoryGateway for InMemoryHistory {
    async fn insert(&self, entry: HistoryEntry) -> Result<(), HistoryError> {
        self.entries
            .write()
            .map_err(|_| HistoryError::BadState)?
            .entry(entry.job_id)
            .or_insert(entry);
        Ok(())
    }

    async fn update(&self, job_id: JobId, update: HistoryUpdate) -> Result<(), HistoryError> {
        self.entries
            .write()
            .map_err(|_| HistoryError::BadState)?
            .get_mut(&job_id)
            .ok_or(HistoryError::JobNotFound(job_id))?
            .apply(&update);
        Ok(())
    }

    async fn find_by_id(&self, job_id: JobId) -> Result<Option<HistoryEntry>, HistoryError> {
        Ok(self
            .entries
            .read()
            .map_err(|_| HistoryError::BadState)?
            .get(&job_id)
            .cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::history_test_suite;

    history_test_suite!(for: InMemoryHistory::new());

    #[tokio::test]
    async fn clones_share_rows() {
        let history = InMemoryHistory::new();
        let clone = history.clone();
        let entry = crate::history::testing::sample_entry();

        clone.insert(entry.clone()).await.unwrap();

        assert_eq!(history.entries().unwrap(), vec![entry]);
    }
}
