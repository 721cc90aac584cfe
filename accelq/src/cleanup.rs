//! Periodic cleanup of finished jobs.
//!
//! Terminal job records are kept in memory so their results can be collected. Once they are older
//! than a retention threshold they can be dropped with [`crate::Coordinator::cleanup`], or
//! automatically by a background pruner configured with [`CleanupConfig`] and installed via
//! [`crate::Coordinator::with_cleanup`]. History rows are never removed.
//!
//! # Example
//!
//! Remove jobs which finished more than a day ago, checking at the top of every hour:
//!
//! ```
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! use accelq::prelude::*;
//!
//! let config = CleanupConfig::new(
//!     cron::Schedule::from_str("0 0 * * * *").unwrap(),
//!     TimeDelta::hours(24),
//! );
//! let coordinator = Coordinator::new(CoordinatorConfig::default()).with_cleanup(config);
//! ```
use chrono::TimeDelta;

pub(crate) mod runner;

/// When the pruner runs and what it removes.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub(crate) schedule: cron::Schedule,
    pub(crate) max_age: TimeDelta,
}

impl CleanupConfig {
    pub fn new(schedule: cron::Schedule, max_age: TimeDelta) -> Self {
        Self { schedule, max_age }
    }

    pub fn schedule(&self) -> &cron::Schedule {
        &self.schedule
    }

    pub fn max_age(&self) -> TimeDelta {
        self.max_age
    }
}
