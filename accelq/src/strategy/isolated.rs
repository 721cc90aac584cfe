use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::instrument;

use crate::{
    config::IsolatedConfig,
    job::ResultPayload,
    protocol::{WorkerRequest, WorkerResponse},
    routine::{Arguments, ComputeRoutine},
    slots::AcceleratorIndex,
};

use super::{ErrorKind, ExecutionError, ExecutionStrategy};

/// Runs every job in a fresh child process.
///
/// The child is invoked as
/// `<program> <args...> --job-type <tag> --request-file <path> --response-file <path>` and is
/// expected to behave like [`crate::child::run_child`]. When no program is configured the
/// current executable is used, so a binary can act as its own worker.
///
/// Both temporary files are removed once the job is done, whatever the outcome. If the future
/// running the job is dropped, the child is killed.
#[derive(Debug, Default)]
pub struct IsolatedProcess {
    program: Option<PathBuf>,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    temp_dir: Option<PathBuf>,
    job_timeout: Option<Duration>,
    closed: AtomicBool,
}

impl IsolatedProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
            ..Default::default()
        }
    }

    /// Use the currently running executable as the child program.
    pub fn current_exe() -> Self {
        Self::default()
    }

    pub fn from_config(config: &IsolatedConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            envs: config
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            temp_dir: config.temp_dir.clone(),
            job_timeout: config.job_timeout(),
            closed: AtomicBool::new(false),
        }
    }

    /// Arguments placed before the job flags.
    pub fn with_args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Where the request and response files are created, defaults to the system temp dir.
    pub fn with_temp_dir(self, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: Some(temp_dir.into()),
            ..self
        }
    }

    /// Kill the child and fail the job if it runs for longer than `timeout`.
    pub fn with_job_timeout(self, timeout: Duration) -> Self {
        Self {
            job_timeout: Some(timeout),
            ..self
        }
    }

    fn program(&self) -> Result<PathBuf, ExecutionError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    fn temp_path(&self, prefix: &str) -> Result<TempPath, ExecutionError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(".json");
        let file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file.into_temp_path())
    }

    async fn execute(
        &self,
        request: &WorkerRequest,
        request_file: &Path,
        response_file: &Path,
    ) -> Result<ResultPayload, ExecutionError> {
        let encoded = serde_json::to_vec(request).map_err(|err| {
            ExecutionError::new(
                ErrorKind::Protocol,
                format!("Failed to encode job request: {err}"),
            )
        })?;
        tokio::fs::write(request_file, encoded).await?;

        let mut command = Command::new(self.program()?);
        command
            .args(&self.args)
            .arg("--job-type")
            .arg(&request.job_type)
            .arg("--request-file")
            .arg(request_file)
            .arg("--response-file")
            .arg(response_file)
            .envs(self.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;
        tracing::debug!(pid = child.id(), "Spawned child process");

        // Dropping the future on timeout drops the child, which kills it.
        let output = match self.job_timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    ExecutionError::new(
                        ErrorKind::Timeout,
                        format!("Child process did not finish within {timeout:?}"),
                    )
                })??,
            None => child.wait_with_output().await?,
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !output.status.success() {
            let message = match output.status.code() {
                Some(code) => format!("Child process exited with code {code}: {stderr}"),
                None => format!("Child process was terminated by a signal: {stderr}"),
            };
            return Err(ExecutionError::new(ErrorKind::ChildExit, message));
        }
        if !stderr.is_empty() {
            tracing::debug!(stderr, "Child process stderr");
        }

        let response = tokio::fs::read(response_file).await?;
        if response.iter().all(u8::is_ascii_whitespace) {
            return Err(ExecutionError::new(
                ErrorKind::EmptyOutput,
                format!("Child process exited without writing a response: {stderr}"),
            ));
        }
        match serde_json::from_slice(&response) {
            Ok(WorkerResponse::Completed { result }) => Ok(result),
            Ok(WorkerResponse::Failed { error }) => {
                Err(ExecutionError::new(ErrorKind::Routine, error))
            }
            Err(err) => Err(ExecutionError::new(
                ErrorKind::InvalidOutput,
                format!("Failed to parse child process response: {err}"),
            )),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for IsolatedProcess {
    fn name(&self) -> &'static str {
        "isolated"
    }

    #[instrument(skip_all, fields(job_type = routine.job_type(), %accelerator))]
    async fn run(
        &self,
        routine: Arc<dyn ComputeRoutine>,
        arguments: Arguments,
        accelerator: AcceleratorIndex,
    ) -> Result<ResultPayload, ExecutionError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutionError::shutdown());
        }
        let request = WorkerRequest::new(
            routine.job_type(),
            accelerator.get(),
            arguments.with_accelerator(accelerator),
        );

        let request_file = self.temp_path("accelq-request-")?;
        let response_file = self.temp_path("accelq-response-")?;

        let result = self
            .execute(&request, &request_file, &response_file)
            .await;

        for path in [request_file, response_file] {
            let _ = path.close().inspect_err(|err| {
                tracing::warn!(?err, "Failed to remove temporary job file: {err}")
            });
        }
        result
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(all(test, unix))]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::routine::test::succeeding_routine;

    // The flags end up as $1..$6, the response file is $6.
    fn shell(script: &str, dir: &Path) -> IsolatedProcess {
        IsolatedProcess::new("/bin/sh")
            .with_args(["-c", script, "sh"])
            .with_temp_dir(dir)
    }

    async fn run(strategy: &IsolatedProcess) -> Result<ResultPayload, ExecutionError> {
        strategy
            .run(
                succeeding_routine(),
                Arguments::new().with_kwarg("prompt", "a cat"),
                AcceleratorIndex::new(1),
            )
            .await
    }

    fn assert_empty(dir: &Path) {
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn completed_response() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = shell(
            r#"grep -q '"_accelerator_index":1' "$4" || exit 9
               [ "$2" = text_to_image ] || exit 8
               printf '{"status":"completed","result":{"result_location":"/out/cat.png","media_kind":"image/png","display_name":"cat.png"}}' > "$6""#,
            dir.path(),
        );

        let result = run(&strategy).await.unwrap();

        assert_eq!(result, ResultPayload::new("/out/cat.png", "image/png", "cat.png"));
        assert_empty(dir.path());
    }

    #[tokio::test]
    async fn failed_response() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = shell(
            r#"printf '{"status":"failed","error":"CUDA out of memory"}' > "$6""#,
            dir.path(),
        );

        assert_matches!(
            run(&strategy).await,
            Err(ExecutionError { kind: ErrorKind::Routine, message }) if message == "CUDA out of memory"
        );
        assert_empty(dir.path());
    }

    #[tokio::test]
    async fn non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = shell("echo 'driver crashed' >&2; exit 3", dir.path());

        let error = run(&strategy).await.unwrap_err();

        assert_eq!(error.kind, ErrorKind::ChildExit);
        assert!(error.message.contains("code 3"), "{}", error.message);
        assert!(error.message.contains("driver crashed"), "{}", error.message);
        assert_empty(dir.path());
    }

    #[tokio::test]
    async fn empty_response() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = shell("true", dir.path());

        assert_matches!(
            run(&strategy).await,
            Err(ExecutionError { kind: ErrorKind::EmptyOutput, .. })
        );
        assert_empty(dir.path());
    }

    #[tokio::test]
    async fn invalid_response() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = shell(r#"printf nope > "$6""#, dir.path());

        assert_matches!(
            run(&strategy).await,
            Err(ExecutionError { kind: ErrorKind::InvalidOutput, .. })
        );
        assert_empty(dir.path());
    }

    #[tokio::test]
    async fn job_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = shell("sleep 5", dir.path()).with_job_timeout(Duration::from_millis(100));

        assert_matches!(
            run(&strategy).await,
            Err(ExecutionError { kind: ErrorKind::Timeout, .. })
        );
        assert_empty(dir.path());
    }

    #[tokio::test]
    async fn missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let strategy =
            IsolatedProcess::new(dir.path().join("does-not-exist")).with_temp_dir(dir.path());

        assert_matches!(
            run(&strategy).await,
            Err(ExecutionError { kind: ErrorKind::Io, .. })
        );
        assert_empty(dir.path());
    }

    #[tokio::test]
    async fn env_is_passed() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = shell(
            r#"[ "$MODEL" = sdxl ] || exit 4; printf '{"status":"failed","error":"ok"}' > "$6""#,
            dir.path(),
        )
        .with_env("MODEL", "sdxl");

        assert_matches!(
            run(&strategy).await,
            Err(ExecutionError { kind: ErrorKind::Routine, .. })
        );
    }
}
