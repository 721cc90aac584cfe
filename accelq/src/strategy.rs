//! Execution strategies: how a worker actually invokes a compute routine.
//!
//! Two interchangeable strategies are provided:
//!
//! - [`SharedProcess`] runs the routine on the blocking thread pool of the coordinator's own
//!   process. Startup is instant and state (e.g. loaded models) can be shared between jobs, but
//!   memory held by the routine is never reclaimed between jobs.
//! - [`IsolatedProcess`] runs every job in a brand new child process which exits once the job
//!   is done, so all memory (including accelerator memory) is returned to the operating system.
//!   See [`crate::protocol`] for the handoff format and [`crate::child`] for the child side.
use std::{any::Any, fmt::Display, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinError;

use crate::{
    job::ResultPayload,
    routine::{Arguments, ComputeRoutine, RoutineError},
    slots::AcceleratorIndex,
};

mod isolated;
mod shared;

pub use isolated::IsolatedProcess;
pub use shared::SharedProcess;

/// Runs a compute routine on behalf of a worker.
///
/// Implementations are responsible for injecting the accelerator index into the arguments
/// passed to the routine.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        routine: Arc<dyn ComputeRoutine>,
        arguments: Arguments,
        accelerator: AcceleratorIndex,
    ) -> Result<ResultPayload, ExecutionError>;

    /// Release any resources held by the strategy. Later calls to `run` fail.
    async fn shutdown(&self) {}
}

/// The category of an [`ExecutionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The routine itself reported a failure.
    Routine,
    /// The routine panicked.
    Panic,
    /// The child process exited unsuccessfully.
    ChildExit,
    /// The child process exited without writing a response.
    EmptyOutput,
    /// The child process wrote a response that could not be parsed.
    InvalidOutput,
    Io,
    /// The job exceeded its wall clock limit.
    Timeout,
    /// The request could not be encoded for, or was rejected by, the child.
    Protocol,
    /// The strategy has been shut down.
    Shutdown,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Routine => "routine",
            Self::Panic => "panic",
            Self::ChildExit => "child_exit",
            Self::EmptyOutput => "empty_output",
            Self::InvalidOutput => "invalid_output",
            Self::Io => "io",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Shutdown => "shutdown",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The failure of a job's execution. Its message becomes the job's error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn shutdown() -> Self {
        Self::new(ErrorKind::Shutdown, "Execution strategy has been shut down")
    }
}

impl From<RoutineError> for ExecutionError {
    fn from(value: RoutineError) -> Self {
        Self::new(ErrorKind::Routine, value.message())
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic_message(&*panic).unwrap_or(msg),
            Err(_) => msg,
        };
        Self::new(ErrorKind::Panic, format!("Routine panicked: {message}"))
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> Option<String> {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
}

impl From<std::io::Error> for ExecutionError {
    fn from(value: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, value.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn join_error_carries_panic_message() {
        let error = tokio::task::spawn_blocking(|| panic!("tensor shape mismatch"))
            .await
            .unwrap_err();

        let error = ExecutionError::from(error);

        assert_eq!(error.kind, ErrorKind::Panic);
        assert_eq!(error.to_string(), "Routine panicked: tensor shape mismatch");
    }

    #[test]
    fn routine_error_keeps_message() {
        let error = ExecutionError::from(RoutineError::new("prompt too long"));
        assert_eq!(error.kind, ErrorKind::Routine);
        assert_eq!(error.to_string(), "prompt too long");
    }
}
