use std::sync::Arc;

use crate::routine::{Arguments, ComputeRoutine};

use super::JobId;

/// A unit of work travelling through the pending queue.
///
/// Each item is consumed by exactly one worker.
pub(crate) struct WorkItem {
    pub job_id: JobId,
    pub routine: Arc<dyn ComputeRoutine>,
    pub arguments: Arguments,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("job_id", &self.job_id)
            .field("job_type", &self.routine.job_type())
            .field("arguments", &self.arguments)
            .finish()
    }
}
