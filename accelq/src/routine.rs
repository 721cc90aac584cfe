//! Compute routines: the code that actually performs a job.
//!
//! The coordinator treats a routine as an opaque callable. It receives an [`Arguments`] bag
//! which always includes the index of the accelerator it has been assigned under the
//! [`ACCELERATOR_INDEX_KEY`] keyword, and either returns a [`ResultPayload`] or fails with a
//! [`RoutineError`].
//!
//! # Example
//!
//! ```
//! use accelq::prelude::*;
//!
//! struct Upscale;
//!
//! impl ComputeRoutine for Upscale {
//!     fn job_type(&self) -> &str {
//!         "upscale"
//!     }
//!
//!     fn run(&self, args: &Arguments) -> Result<ResultPayload, RoutineError> {
//!         let source = args
//!             .kwarg("source")
//!             .and_then(|value| value.as_str())
//!             .ok_or_else(|| RoutineError::new("missing source image"))?;
//!         Ok(ResultPayload::new(format!("{source}.x2.png"), "image/png", "upscaled.png"))
//!     }
//! }
//!
//! let registry = RoutineRegistry::new().with_routine(Upscale);
//! assert!(registry.get("upscale").is_some());
//! ```
use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{job::ResultPayload, slots::AcceleratorIndex};

/// The reserved keyword under which the assigned accelerator index is passed to a routine.
pub const ACCELERATOR_INDEX_KEY: &str = "_accelerator_index";

/// Positional and keyword arguments for a compute routine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    /// The accelerator this invocation has been assigned, if any.
    pub fn accelerator_index(&self) -> Option<usize> {
        self.kwarg(ACCELERATOR_INDEX_KEY)
            .and_then(Value::as_u64)
            .and_then(|index| usize::try_from(index).ok())
    }

    pub(crate) fn with_accelerator(self, accelerator: AcceleratorIndex) -> Self {
        self.with_kwarg(ACCELERATOR_INDEX_KEY, accelerator.get())
    }
}

impl From<Map<String, Value>> for Arguments {
    fn from(kwargs: Map<String, Value>) -> Self {
        Self {
            args: Vec::new(),
            kwargs,
        }
    }
}

/// The failure of a compute routine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RoutineError {
    message: String,
}

impl RoutineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for RoutineError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for RoutineError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// A unit of compute work that can be executed by the coordinator.
///
/// Routines are synchronous: they are expected to occupy an accelerator (or a CPU) for an
/// extended period of time. The in-process strategy runs them on a blocking thread so they
/// never stall the async runtime.
///
/// Implementations must be safe to invoke repeatedly. When running under
/// [`crate::strategy::IsolatedProcess`] every invocation happens in a brand new process, so a
/// routine cannot rely on state retained between jobs.
pub trait ComputeRoutine: Send + Sync {
    /// The job type tag.
    ///
    /// This identifies the routine across process boundaries: the isolated child process looks
    /// the routine up in its own [`RoutineRegistry`] by this tag. It should therefore be
    /// unique and stable.
    fn job_type(&self) -> &str;

    fn run(&self, args: &Arguments) -> Result<ResultPayload, RoutineError>;
}

/// A [`ComputeRoutine`] backed by a closure, constructed via [`from_fn`].
pub struct FnRoutine<F> {
    job_type: String,
    f: F,
}

/// Build a [`ComputeRoutine`] from a job type tag and a closure.
pub fn from_fn<F>(job_type: impl Into<String>, f: F) -> FnRoutine<F>
where
    F: Fn(&Arguments) -> Result<ResultPayload, RoutineError> + Send + Sync,
{
    FnRoutine {
        job_type: job_type.into(),
        f,
    }
}

impl<F> ComputeRoutine for FnRoutine<F>
where
    F: Fn(&Arguments) -> Result<ResultPayload, RoutineError> + Send + Sync,
{
    fn job_type(&self) -> &str {
        &self.job_type
    }

    fn run(&self, args: &Arguments) -> Result<ResultPayload, RoutineError> {
        (self.f)(args)
    }
}

/// A lookup table of routines by job type tag.
#[derive(Clone, Default)]
pub struct RoutineRegistry {
    routines: HashMap<String, Arc<dyn ComputeRoutine>>,
}

impl RoutineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routine(mut self, routine: impl ComputeRoutine + 'static) -> Self {
        self.register(Arc::new(routine));
        self
    }

    /// Register a routine, replacing any routine previously registered for the same job type.
    pub fn register(&mut self, routine: Arc<dyn ComputeRoutine>) {
        self.routines.insert(routine.job_type().to_owned(), routine);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn ComputeRoutine>> {
        self.routines.get(job_type).cloned()
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.routines.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for RoutineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.routines.keys()).finish()
    }
}
