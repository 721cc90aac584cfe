use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::{
    job::ResultPayload,
    routine::{Arguments, ComputeRoutine},
    slots::AcceleratorIndex,
};

use super::{ExecutionError, ExecutionStrategy};

/// Runs routines on the blocking thread pool of the current process.
///
/// At most `max_concurrency` routines run at once. A panicking routine fails its job without
/// taking the worker down.
#[derive(Debug)]
pub struct SharedProcess {
    permits: Arc<Semaphore>,
}

impl SharedProcess {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for SharedProcess {
    fn name(&self) -> &'static str {
        "shared"
    }

    async fn run(
        &self,
        routine: Arc<dyn ComputeRoutine>,
        arguments: Arguments,
        accelerator: AcceleratorIndex,
    ) -> Result<ResultPayload, ExecutionError> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ExecutionError::shutdown())?;
        let arguments = arguments.with_accelerator(accelerator);

        tracing::debug!(job_type = routine.job_type(), %accelerator, "Running routine in process");
        tokio::task::spawn_blocking(move || routine.run(&arguments))
            .await?
            .map_err(ExecutionError::from)
    }

    async fn shutdown(&self) {
        self.permits.close();
    }
}
