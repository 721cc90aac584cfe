use std::path::{Path, PathBuf};

use accelq::config::CoordinatorConfig;
use serde::Deserialize;

const ENV_PREFIX: &str = "ACCELQ";
const DEFAULT_FILE: &str = "accelq";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub logging: LoggingSettings,
    /// Where the demo routines write their images.
    pub output_dir: PathBuf,
    /// Job history is kept in memory when unset.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorConfig::default(),
            logging: LoggingSettings::default(),
            output_dir: PathBuf::from("outputs"),
            database_url: None,
            database_max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// An `EnvFilter` directive, overridden by `RUST_LOG`.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info,accelq=debug".to_owned(),
            json: false,
        }
    }
}

impl Settings {
    /// Load settings from `path` (or an optional `accelq.toml` in the working directory), then
    /// apply `ACCELQ__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_FILE).required(false),
        };
        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod test {
    use accelq::config::ExecutionMode;

    use super::*;

    #[test]
    fn file_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accelq.toml");
        std::fs::write(
            &path,
            r#"
output_dir = "/var/lib/accelq"

[coordinator]
max_workers = 2
accelerators = 1
execution_mode = "process"

[coordinator.isolated]
job_timeout_secs = 120

[logging]
json = true
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();

        assert_eq!(settings.output_dir, PathBuf::from("/var/lib/accelq"));
        assert_eq!(settings.coordinator.max_workers, 2);
        assert_eq!(settings.coordinator.accelerators, Some(1));
        assert_eq!(settings.coordinator.execution_mode, ExecutionMode::Isolated);
        assert_eq!(settings.coordinator.isolated.job_timeout_secs, Some(120));
        assert_eq!(settings.coordinator.poll_interval_ms, 500);
        assert!(settings.logging.json);
        assert_eq!(settings.database_url, None);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
