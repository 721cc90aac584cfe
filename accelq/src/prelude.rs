//! The purpose of this module is to alleviate the need to import many of the `[accelq]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use accelq::prelude::*;
//! ```
pub use crate::cleanup::CleanupConfig;
pub use crate::config::{CoordinatorConfig, ExecutionMode};
pub use crate::history::{HistoryEntry, HistoryError, HistoryGateway, HistoryUpdate};
pub use crate::job::{JobId, JobMetadata, JobRecord, JobStatus, OwnerId, ResultPayload};
pub use crate::registry::{QueueInfo, StatusCounts};
pub use crate::routine::{Arguments, ComputeRoutine, RoutineError, RoutineRegistry};
pub use crate::strategy::{
    ErrorKind, ExecutionError, ExecutionStrategy, IsolatedProcess, SharedProcess,
};
pub use crate::{Coordinator, CoordinatorError, JobLookup};
