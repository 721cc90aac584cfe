//! A single node scheduler for long running, accelerator bound compute jobs.
//!
//! Jobs are submitted to a [`Coordinator`] which returns a [`JobId`] immediately. A fixed pool
//! of workers takes jobs from a single FIFO queue, and each worker is bound to one accelerator.
//! An accelerator never runs more than one job at a time, however many workers share it.
//!
//! Each job is executed by an [`ExecutionStrategy`]. Either in the coordinator's own process
//! ([`SharedProcess`]) or in a fresh child process per job ([`IsolatedProcess`]).
//!
//! Every lifecycle transition is written through to a [`HistoryGateway`] on a best effort basis.
//!
//! # Example
//!
//! ```
//! use std::{sync::Arc, time::Duration};
//! use accelq::prelude::*;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let coordinator = Coordinator::new(CoordinatorConfig {
//!     accelerators: Some(1),
//!     ..Default::default()
//! });
//! coordinator.start().await;
//!
//! let routine = Arc::new(accelq::routine::from_fn("text_to_image", |_args| {
//!     Ok(ResultPayload::new("/tmp/cat.png", "image/png", "cat.png"))
//! }));
//! let job_id = coordinator
//!     .submit(routine, Arguments::new().with_kwarg("prompt", "a cat"), JobMetadata::default())
//!     .await
//!     .unwrap();
//!
//! let record = coordinator
//!     .get_result(job_id, Some(Duration::from_secs(10)))
//!     .await
//!     .unwrap();
//! assert_eq!(record.status, JobStatus::Completed);
//!
//! coordinator.stop().await.unwrap();
//! # });
//! ```
use std::{
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use cleanup::{runner::CleanupRunner, CleanupConfig};
use config::{CoordinatorConfig, ExecutionMode};
use history::{HistoryEntry, HistoryError, HistoryGateway, NullHistory};
use job::{work_item::WorkItem, JobId, JobMetadata, JobRecord, OwnerId};
use registry::{JobRegistry, QueueInfo};
use routine::{Arguments, ComputeRoutine};
use slots::AcceleratorSlots;
use strategy::{ExecutionStrategy, IsolatedProcess, SharedProcess};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use worker::Worker;

pub mod child;
pub mod cleanup;
pub mod config;
pub mod history;
pub mod job;
pub mod prelude;
pub mod protocol;
pub mod registry;
pub mod routine;
pub mod slots;
pub mod strategy;
mod worker;

/// Accepts jobs and runs them on a fixed pool of workers.
///
/// The coordinator is an explicit instance, share it behind an [`Arc`] to submit from many
/// tasks. It must be [started](Coordinator::start) before jobs can be submitted, and once
/// [stopped](Coordinator::stop) it cannot be started again.
pub struct Coordinator {
    config: CoordinatorConfig,
    accelerators: usize,
    workers: usize,
    registry: JobRegistry,
    history: Arc<dyn HistoryGateway>,
    strategy: Arc<dyn ExecutionStrategy>,
    cleanup: Option<CleanupConfig>,
    state: Mutex<State>,
    sender: RwLock<Option<mpsc::UnboundedSender<WorkItem>>>,
}

enum State {
    Idle,
    Running(RunningHandles),
    Stopped,
}

struct RunningHandles {
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// The result of [`Coordinator::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobLookup {
    /// The job is known to this coordinator.
    Live(JobRecord),
    /// The job is only known to the history gateway.
    Archived(HistoryEntry),
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("The coordinator is not running")]
    NotRunning,
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Error communicating with the history gateway")]
    History(#[from] HistoryError),
    #[error("Invalid cleanup schedule")]
    InvalidSchedule(#[from] cron::error::Error),
    #[error("Cleanup max age of {0} seconds is out of range")]
    InvalidMaxAge(i64),
}

impl Coordinator {
    /// Create a coordinator using the execution strategy named by the config.
    ///
    /// No history is written and no pruner runs until configured with the builder methods.
    pub fn new(config: CoordinatorConfig) -> Self {
        let accelerators = config.accelerator_count();
        let workers = config.worker_count(accelerators);
        let strategy: Arc<dyn ExecutionStrategy> = match config.execution_mode {
            ExecutionMode::Shared => Arc::new(SharedProcess::new(workers)),
            ExecutionMode::Isolated => Arc::new(IsolatedProcess::from_config(&config.isolated)),
        };
        Self {
            config,
            accelerators,
            workers,
            registry: JobRegistry::new(),
            history: Arc::new(NullHistory),
            strategy,
            cleanup: None,
            state: Mutex::new(State::Idle),
            sender: RwLock::new(None),
        }
    }

    /// Like [`Coordinator::new`], also installing the pruner described by `config.cleanup`.
    pub fn from_config(config: CoordinatorConfig) -> Result<Self, CoordinatorError> {
        let cleanup = config.cleanup.to_config()?;
        let coordinator = Self::new(config);
        Ok(match cleanup {
            Some(cleanup) => coordinator.with_cleanup(cleanup),
            None => coordinator,
        })
    }

    pub fn with_history<H>(self, history: H) -> Self
    where
        H: HistoryGateway + 'static,
    {
        Self {
            history: Arc::new(history),
            ..self
        }
    }

    pub fn with_strategy<S>(self, strategy: S) -> Self
    where
        S: ExecutionStrategy + 'static,
    {
        Self {
            strategy: Arc::new(strategy),
            ..self
        }
    }

    /// Periodically remove finished jobs while running.
    pub fn with_cleanup(self, cleanup: CleanupConfig) -> Self {
        Self {
            cleanup: Some(cleanup),
            ..self
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn accelerator_count(&self) -> usize {
        self.accelerators
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn is_running(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the workers, the accelerator slots, and the pruner if configured.
    ///
    /// Calling this while already running has no effect.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        match *state {
            State::Idle => {}
            State::Running(_) => {
                tracing::warn!("Coordinator is already running");
                return;
            }
            State::Stopped => {
                tracing::warn!("Coordinator has been stopped and cannot be restarted");
                return;
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Arc::new(Mutex::new(receiver));
        let slots = Arc::new(AcceleratorSlots::new(self.accelerators));
        if slots.is_cpu_fallback() {
            tracing::info!("No accelerators detected, running jobs on the CPU");
        }
        let cancellation_token = CancellationToken::new();

        let mut handles: Vec<_> = (0..self.workers)
            .map(|id| {
                Worker {
                    id,
                    accelerator: slots.index_for_worker(id),
                    queue: queue.clone(),
                    slots: slots.clone(),
                    registry: self.registry.clone(),
                    history: self.history.clone(),
                    strategy: self.strategy.clone(),
                }
                .spawn(cancellation_token.child_token())
            })
            .collect();
        if let Some(cleanup) = &self.cleanup {
            handles.push(
                CleanupRunner::new(self.registry.clone(), cleanup.clone())
                    .spawn(cancellation_token.child_token()),
            );
        }

        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = Some(sender);
        *state = State::Running(RunningHandles {
            cancellation_token,
            handles,
        });
        tracing::info!(
            workers = self.workers,
            accelerators = self.accelerators,
            strategy = self.strategy.name(),
            "Coordinator started with {} workers",
            self.workers
        );
    }

    /// Queue a job, returning its id without waiting for it to run.
    ///
    /// An empty job type in `metadata` is filled in from the routine.
    pub async fn submit(
        &self,
        routine: Arc<dyn ComputeRoutine>,
        arguments: Arguments,
        metadata: JobMetadata,
    ) -> Result<JobId, CoordinatorError> {
        let sender = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CoordinatorError::NotRunning)?;

        let metadata = if metadata.job_type.is_empty() {
            JobMetadata {
                job_type: routine.job_type().to_owned(),
                ..metadata
            }
        } else {
            metadata
        };
        let job_id = JobId::new();
        let record = JobRecord::new(job_id, metadata, self.registry.pending_count() + 1);
        self.registry.insert(record.clone());
        history::write_created(&*self.history, &record).await;

        let sent = sender
            .send(WorkItem {
                job_id,
                routine,
                arguments,
            })
            .is_ok();
        if !sent {
            tracing::warn!(%job_id, "Coordinator stopped while submitting job {job_id}");
            if let Some(mut record) = self.registry.remove(job_id) {
                if record.mark_cancelled().is_ok() {
                    history::write_transition(&*self.history, &record).await;
                }
            }
            return Err(CoordinatorError::NotRunning);
        }

        tracing::info!(
            %job_id,
            job_type = %record.metadata.job_type,
            queue_position = record.queue_position_hint,
            "Submitted job {job_id}"
        );
        Ok(job_id)
    }

    /// The current record of a job.
    pub fn get_status(&self, job_id: JobId) -> Option<JobRecord> {
        self.registry.get(job_id)
    }

    /// Wait for a job to finish.
    ///
    /// Returns the record as soon as it is terminal, or as it is when `timeout` elapses. Without
    /// a timeout this waits indefinitely. Timing out never affects the job itself.
    pub async fn get_result(&self, job_id: JobId, timeout: Option<Duration>) -> Option<JobRecord> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let poll_interval = self.config.poll_interval();
        loop {
            let record = self.registry.get(job_id)?;
            if record.is_terminal() {
                return Some(record);
            }
            let delay = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Some(record);
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };
            tokio::time::sleep(delay).await;
        }
    }

    /// Cancel a job which has not started yet.
    ///
    /// Returns `false` for jobs which are running, finished, or unknown.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        let cancelled = self
            .registry
            .update(job_id, |record| record.mark_cancelled().map(|()| record.clone()));
        match cancelled {
            Some(Ok(record)) => {
                history::write_transition(&*self.history, &record).await;
                tracing::info!(%job_id, "Cancelled job {job_id}");
                true
            }
            Some(Err(err)) => {
                tracing::debug!(%job_id, ?err, "Job {job_id} cannot be cancelled: {err}");
                false
            }
            None => false,
        }
    }

    /// Load and capacity of the coordinator, with job counts optionally restricted to one owner.
    pub fn get_queue_info(&self, owner: Option<OwnerId>) -> QueueInfo {
        QueueInfo {
            is_running: self.is_running(),
            accelerator_count: self.accelerators,
            max_workers: self.workers,
            queue_size: self.registry.pending_count(),
            tasks: self.registry.counts(owner),
        }
    }

    /// Forget finished jobs which completed more than `max_age` ago.
    ///
    /// Their history is kept. Returns the number of jobs removed.
    pub fn cleanup(&self, max_age: TimeDelta) -> usize {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            tracing::debug!("Cleanup max age {max_age} reaches past the earliest date");
            return 0;
        };
        let removed = self.registry.remove_terminal_older_than(cutoff);
        tracing::debug!(removed, "Removed {removed} finished jobs");
        removed
    }

    /// Look a job up in memory, falling back to the history gateway.
    pub async fn lookup(&self, job_id: JobId) -> Result<Option<JobLookup>, CoordinatorError> {
        if let Some(record) = self.get_status(job_id) {
            return Ok(Some(JobLookup::Live(record)));
        }
        Ok(self
            .history
            .find_by_id(job_id)
            .await?
            .map(JobLookup::Archived))
    }

    /// Stop accepting jobs and wait for the workers to finish their current job.
    ///
    /// Jobs still waiting in the queue, or for an accelerator slot, are left pending and never
    /// run.
    pub async fn stop(&self) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock().await;
        let running = match std::mem::replace(&mut *state, State::Stopped) {
            State::Running(running) => running,
            previous => {
                *state = previous;
                tracing::warn!("Coordinator is not running");
                return Ok(());
            }
        };

        tracing::debug!("Shutting down coordinator workers");
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        running.cancellation_token.cancel();
        let results = futures::future::join_all(running.handles).await;
        self.strategy.shutdown().await;

        let stranded = self.registry.pending_count();
        if stranded > 0 {
            tracing::warn!(
                stranded,
                "Coordinator stopped with {stranded} pending jobs which will not run"
            );
        }
        results
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                tracing::error!(?err, "Worker failed during shutdown: {err}");
                CoordinatorError::GracefulShutdownFailed
            })?;
        tracing::info!("Coordinator stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("accelerators", &self.accelerators)
            .field("workers", &self.workers)
            .field("strategy", &self.strategy.name())
            .field("is_running", &self.is_running())
            .finish()
    }
}
