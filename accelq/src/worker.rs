use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    history::{self, HistoryGateway},
    job::work_item::WorkItem,
    registry::JobRegistry,
    slots::{AcceleratorIndex, AcceleratorSlots},
    strategy::{panic_message, ErrorKind, ExecutionError, ExecutionStrategy},
};

pub(crate) type Queue = Arc<Mutex<mpsc::UnboundedReceiver<WorkItem>>>;

/// A loop taking jobs from the shared queue and running them on one accelerator.
pub(crate) struct Worker {
    pub id: usize,
    pub accelerator: AcceleratorIndex,
    pub queue: Queue,
    pub slots: Arc<AcceleratorSlots>,
    pub registry: JobRegistry,
    pub history: Arc<dyn HistoryGateway>,
    pub strategy: Arc<dyn ExecutionStrategy>,
}

impl Worker {
    /// Run until cancelled or the queue is closed. A job in progress is always finished first.
    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancellation_token.cancelled() => break,
                    item = self.next_item() => item,
                };
                match item {
                    Some(item) => self.process(item, &cancellation_token).await,
                    None => break,
                }
            }
            tracing::debug!(
                worker = self.id,
                accelerator = %self.accelerator,
                "Shutting down worker {}",
                self.id
            );
        })
    }

    async fn next_item(&self) -> Option<WorkItem> {
        self.queue.lock().await.recv().await
    }

    /// An item still waiting for its slot when the worker is cancelled is dropped, and its
    /// record stays pending.
    #[instrument(
        skip(self, item, cancellation_token),
        fields(job_id = %item.job_id, worker = self.id, accelerator = %self.accelerator)
    )]
    async fn process(&self, item: WorkItem, cancellation_token: &CancellationToken) {
        let WorkItem {
            job_id,
            routine,
            arguments,
        } = item;
        let slot = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                tracing::debug!(%job_id, "Worker stopped while job {job_id} waited for a slot");
                return;
            }
            slot = self.slots.acquire(self.accelerator) => slot,
        };

        let started = self.registry.update(job_id, |record| {
            record.mark_running().map(|()| record.clone())
        });
        let record = match started {
            Some(Ok(record)) => record,
            Some(Err(err)) => {
                tracing::debug!(%job_id, ?err, "Skipping job {job_id}: {err}");
                return;
            }
            None => {
                tracing::warn!(%job_id, "Skipping job {job_id}, its record no longer exists");
                return;
            }
        };
        history::write_transition(&*self.history, &record).await;

        tracing::debug!(%job_id, job_type = routine.job_type(), "Executing job {job_id}");
        let outcome = AssertUnwindSafe(self.strategy.run(routine, arguments, self.accelerator))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(&*panic).unwrap_or_else(|| "unknown panic".to_owned());
                Err(ExecutionError::new(
                    ErrorKind::Panic,
                    format!("Execution strategy panicked: {message}"),
                ))
            });
        let error = outcome.as_ref().err().cloned();

        let finished = self.registry.update(job_id, move |record| {
            let marked = match outcome {
                Ok(result) => record.mark_completed(result),
                Err(error) => record.mark_failed(error.to_string()),
            };
            marked.map(|()| record.clone())
        });
        drop(slot);

        match finished {
            Some(Ok(record)) => {
                history::write_transition(&*self.history, &record).await;
                let execution_ms = record
                    .execution_time()
                    .map(|delta| delta.num_milliseconds());
                match error {
                    None => tracing::info!(%job_id, ?execution_ms, "Job {job_id} completed"),
                    Some(error) => tracing::error!(
                        %job_id,
                        ?execution_ms,
                        error_type = %error.kind,
                        "Job {job_id} failed: {error}"
                    ),
                }
            }
            Some(Err(err)) => tracing::error!(
                ?err,
                %job_id,
                "Failed to record the outcome of job {job_id}: {err}"
            ),
            None => tracing::warn!(%job_id, "Job {job_id} was removed while running"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        history::NullHistory,
        job::{JobId, JobMetadata, JobRecord, JobStatus},
        routine::{test::succeeding_routine, Arguments},
        strategy::SharedProcess,
    };

    fn worker(registry: &JobRegistry) -> (Worker, mpsc::UnboundedSender<WorkItem>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = Worker {
            id: 0,
            accelerator: AcceleratorIndex::new(0),
            queue: Arc::new(Mutex::new(receiver)),
            slots: Arc::new(AcceleratorSlots::new(1)),
            registry: registry.clone(),
            history: Arc::new(NullHistory),
            strategy: Arc::new(SharedProcess::new(1)),
        };
        (worker, sender)
    }

    fn enqueue(registry: &JobRegistry, sender: &mpsc::UnboundedSender<WorkItem>) -> JobId {
        let record = JobRecord::new(JobId::new(), JobMetadata::new("text_to_image"), 0);
        let job_id = record.id;
        registry.insert(record);
        sender
            .send(WorkItem {
                job_id,
                routine: succeeding_routine(),
                arguments: Arguments::new(),
            })
            .unwrap();
        job_id
    }

    #[tokio::test]
    async fn skips_cancelled_items() {
        let registry = JobRegistry::new();
        let (worker, sender) = worker(&registry);
        let cancelled = enqueue(&registry, &sender);
        let kept = enqueue(&registry, &sender);
        registry.update(cancelled, |record| record.mark_cancelled().unwrap());
        drop(sender);

        let handle = worker.spawn(CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let cancelled = registry.get(cancelled).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(cancelled.started_at, None);
        assert_eq!(registry.get(kept).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn exits_when_cancelled() {
        let registry = JobRegistry::new();
        let (worker, _sender) = worker(&registry);
        let token = CancellationToken::new();
        let handle = worker.spawn(token.clone());

        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn leaves_job_pending_when_cancelled_waiting_for_slot() {
        let registry = JobRegistry::new();
        let (worker, sender) = worker(&registry);
        let held = worker.slots.try_acquire(AcceleratorIndex::new(0)).unwrap();
        let job_id = enqueue(&registry, &sender);
        let token = CancellationToken::new();
        let handle = worker.spawn(token.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        drop(held);

        let record = registry.get(job_id).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.started_at, None);
    }
}
