//! Coordinator configuration.
//!
//! Every field has a default, so an empty document deserializes to a working configuration.
//! The legacy mode names `thread` and `process` are accepted as aliases.
use std::{collections::HashMap, path::PathBuf, str::FromStr, time::Duration};

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::{cleanup::CleanupConfig, slots::detect_accelerators, CoordinatorError};

/// Which [`crate::strategy::ExecutionStrategy`] the coordinator uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    #[serde(alias = "thread")]
    Shared,
    #[serde(alias = "process")]
    Isolated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// The number of worker loops, `0` means one per accelerator.
    pub max_workers: usize,
    /// The number of accelerators, detected from the environment when unset.
    pub accelerators: Option<usize>,
    pub execution_mode: ExecutionMode,
    /// How often `get_result` checks for completion.
    pub poll_interval_ms: u64,
    /// The timeout callers should use for synchronous style waits.
    pub sync_timeout_secs: u64,
    pub isolated: IsolatedConfig,
    pub cleanup: CleanupSettings,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_workers: 0,
            accelerators: None,
            execution_mode: ExecutionMode::default(),
            poll_interval_ms: 500,
            sync_timeout_secs: 600,
            isolated: IsolatedConfig::default(),
            cleanup: CleanupSettings::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn accelerator_count(&self) -> usize {
        self.accelerators.unwrap_or_else(detect_accelerators)
    }

    pub fn worker_count(&self, accelerators: usize) -> usize {
        match self.max_workers {
            0 => accelerators.max(1),
            workers => workers,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }
}

/// Settings for [`crate::strategy::IsolatedProcess`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolatedConfig {
    /// The child program, the current executable when unset.
    pub program: Option<PathBuf>,
    /// Arguments placed before the job flags.
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub temp_dir: Option<PathBuf>,
    pub job_timeout_secs: Option<u64>,
}

impl IsolatedConfig {
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }
}

/// Settings for the background pruner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    pub enabled: bool,
    /// A cron expression with a seconds field.
    pub schedule: String,
    /// How long terminal jobs stay in memory.
    pub max_age_secs: i64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 0 * * * *".to_owned(),
            max_age_secs: 24 * 60 * 60,
        }
    }
}

impl CleanupSettings {
    /// `None` when `max_age_secs` does not fit a [`TimeDelta`].
    pub fn max_age(&self) -> Option<TimeDelta> {
        TimeDelta::try_seconds(self.max_age_secs)
    }

    /// The pruner configuration, `None` when disabled.
    pub fn to_config(&self) -> Result<Option<CleanupConfig>, CoordinatorError> {
        if !self.enabled {
            return Ok(None);
        }
        let schedule = cron::Schedule::from_str(&self.schedule)?;
        let max_age = self
            .max_age()
            .ok_or(CoordinatorError::InvalidMaxAge(self.max_age_secs))?;
        Ok(Some(CleanupConfig::new(schedule, max_age)))
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: CoordinatorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CoordinatorConfig::default());
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.sync_timeout(), Duration::from_secs(600));
        assert_eq!(config.cleanup.max_age(), Some(TimeDelta::hours(24)));
    }

    #[test]
    fn worker_count_auto() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.worker_count(0), 1);
        assert_eq!(config.worker_count(4), 4);

        let config = CoordinatorConfig {
            max_workers: 3,
            ..Default::default()
        };
        assert_eq!(config.worker_count(8), 3);
    }

    #[test]
    fn explicit_accelerators() {
        let config = CoordinatorConfig {
            accelerators: Some(2),
            ..Default::default()
        };
        assert_eq!(config.accelerator_count(), 2);
    }

    #[test]
    fn legacy_mode_names() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"execution_mode": "process"}"#).unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Isolated);
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"execution_mode": "thread"}"#).unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Shared);
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"execution_mode": "isolated"}"#).unwrap();
        assert_eq!(config.execution_mode, ExecutionMode::Isolated);
    }

    #[test]
    fn isolated_settings() {
        let config: CoordinatorConfig = serde_json::from_str(
            r#"{"isolated": {"args": ["worker"], "job_timeout_secs": 900}}"#,
        )
        .unwrap();
        assert_eq!(config.isolated.args, ["worker"]);
        assert_eq!(
            config.isolated.job_timeout(),
            Some(Duration::from_secs(900))
        );
        assert_eq!(config.isolated.program, None);
    }

    #[test]
    fn cleanup_settings() {
        assert!(CleanupSettings::default().to_config().unwrap().is_some());

        let disabled = CleanupSettings {
            enabled: false,
            ..Default::default()
        };
        assert!(disabled.to_config().unwrap().is_none());

        let invalid = CleanupSettings {
            schedule: "every hour".to_owned(),
            ..Default::default()
        };
        assert_matches!(invalid.to_config(), Err(CoordinatorError::InvalidSchedule(_)));
    }

    #[test]
    fn cleanup_max_age_out_of_range() {
        let settings = CleanupSettings {
            max_age_secs: i64::MAX,
            ..Default::default()
        };
        assert_eq!(settings.max_age(), None);
        assert_matches!(
            settings.to_config(),
            Err(CoordinatorError::InvalidMaxAge(i64::MAX))
        );

        let disabled = CleanupSettings {
            enabled: false,
            ..settings
        };
        assert!(disabled.to_config().unwrap().is_none());
    }
}
