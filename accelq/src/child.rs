//! The child side of [`crate::strategy::IsolatedProcess`].
//!
//! A binary that wants to serve as an isolated worker parses the three job flags into a
//! [`ChildInvocation`] and hands it to [`run_child`] together with the routines it knows about.
//! The process should then exit with the returned code.
//!
//! ```no_run
//! use accelq::child::{run_child, ChildInvocation};
//! use accelq::prelude::*;
//!
//! let registry = RoutineRegistry::new();
//! let invocation = ChildInvocation::new("text_to_image", "/tmp/request.json", "/tmp/response.json");
//! std::process::exit(run_child(&registry, &invocation));
//! ```
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    protocol::{WorkerRequest, WorkerResponse, PROTOCOL_VERSION},
    routine::RoutineRegistry,
    strategy::panic_message,
};

/// The exit code used when not even a response could be written.
pub const EXIT_RESPONSE_FAILED: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInvocation {
    pub job_type: String,
    pub request_file: PathBuf,
    pub response_file: PathBuf,
}

impl ChildInvocation {
    pub fn new(
        job_type: impl Into<String>,
        request_file: impl Into<PathBuf>,
        response_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            request_file: request_file.into(),
            response_file: response_file.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ChildError {
    #[error("Failed to access job file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to decode job request: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Execute the single job described by `invocation` and write its response.
///
/// Returns `0` once any response has been written, including a failed one, and
/// [`EXIT_RESPONSE_FAILED`] only when the response itself could not be written.
pub fn run_child(registry: &RoutineRegistry, invocation: &ChildInvocation) -> i32 {
    let response = match load_request(&invocation.request_file) {
        Ok(request) => execute(registry, invocation, request),
        Err(err) => {
            tracing::error!(?err, "Failed to load job arguments: {err}");
            WorkerResponse::failed(format!("Failed to load job arguments: {err}"))
        }
    };

    match write_response(&invocation.response_file, &response) {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(?err, "Failed to write job response: {err}");
            EXIT_RESPONSE_FAILED
        }
    }
}

fn execute(
    registry: &RoutineRegistry,
    invocation: &ChildInvocation,
    request: WorkerRequest,
) -> WorkerResponse {
    if !request.is_supported() {
        return WorkerResponse::failed(format!(
            "Unsupported protocol version {}, expected {PROTOCOL_VERSION}",
            request.version
        ));
    }
    if request.job_type != invocation.job_type {
        return WorkerResponse::failed(format!(
            "Job type mismatch: invoked as {} but request is for {}",
            invocation.job_type, request.job_type
        ));
    }
    let Some(routine) = registry.get(&request.job_type) else {
        return WorkerResponse::failed(format!("Unknown job type: {}", request.job_type));
    };

    tracing::debug!(
        job_type = %request.job_type,
        accelerator = request.accelerator_index,
        "Running isolated job"
    );
    match catch_unwind(AssertUnwindSafe(|| routine.run(&request.arguments))) {
        Ok(result) => result.map_err(|err| err.to_string()).into(),
        Err(panic) => {
            let message = panic_message(&*panic).unwrap_or_else(|| "unknown panic".to_owned());
            WorkerResponse::failed(format!("Routine panicked: {message}"))
        }
    }
}

fn load_request(path: &Path) -> Result<WorkerRequest, ChildError> {
    let bytes = std::fs::read(path).map_err(|source| ChildError::Io {
        path: path.to_owned(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_response(path: &Path, response: &WorkerResponse) -> Result<(), ChildError> {
    let bytes = serde_json::to_vec(response)?;
    std::fs::write(path, bytes).map_err(|source| ChildError::Io {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::{
        job::ResultPayload,
        routine::{from_fn, Arguments},
    };

    fn registry() -> RoutineRegistry {
        RoutineRegistry::new()
            .with_routine(from_fn("text_to_image", |args| {
                let prompt = args
                    .kwarg("prompt")
                    .and_then(|prompt| prompt.as_str())
                    .ok_or("missing prompt")?;
                Ok(ResultPayload::new(
                    format!("/out/{}.png", args.accelerator_index().unwrap_or(0)),
                    "image/png",
                    format!("{prompt}.png"),
                ))
            }))
            .with_routine(from_fn("explodes", |_| panic!("segfault in kernel")))
    }

    struct Files {
        _dir: tempfile::TempDir,
        invocation: ChildInvocation,
    }

    fn files(job_type: &str, request: Option<serde_json::Value>) -> Files {
        let dir = tempfile::tempdir().unwrap();
        let invocation = ChildInvocation::new(
            job_type,
            dir.path().join("request.json"),
            dir.path().join("response.json"),
        );
        if let Some(request) = request {
            std::fs::write(&invocation.request_file, request.to_string()).unwrap();
        }
        Files {
            _dir: dir,
            invocation,
        }
    }

    fn response(files: &Files) -> WorkerResponse {
        serde_json::from_slice(&std::fs::read(&files.invocation.response_file).unwrap()).unwrap()
    }

    fn request(job_type: &str, arguments: Arguments) -> serde_json::Value {
        serde_json::to_value(WorkerRequest::new(job_type, 1, arguments)).unwrap()
    }

    #[test]
    fn completed_job() {
        let files = files(
            "text_to_image",
            Some(request(
                "text_to_image",
                Arguments::new()
                    .with_kwarg("prompt", "cat")
                    .with_kwarg("_accelerator_index", 1),
            )),
        );

        assert_eq!(run_child(&registry(), &files.invocation), 0);
        assert_eq!(
            response(&files),
            WorkerResponse::Completed {
                result: ResultPayload::new("/out/1.png", "image/png", "cat.png")
            }
        );
    }

    #[test]
    fn routine_failure_is_reported() {
        let files = files(
            "text_to_image",
            Some(request("text_to_image", Arguments::new())),
        );

        assert_eq!(run_child(&registry(), &files.invocation), 0);
        assert_eq!(response(&files), WorkerResponse::failed("missing prompt"));
    }

    #[test]
    fn panic_is_reported() {
        let files = files("explodes", Some(request("explodes", Arguments::new())));

        assert_eq!(run_child(&registry(), &files.invocation), 0);
        assert_matches!(
            response(&files),
            WorkerResponse::Failed { error } if error.contains("segfault in kernel")
        );
    }

    #[test]
    fn unknown_job_type() {
        let files = files("upscale", Some(request("upscale", Arguments::new())));

        assert_eq!(run_child(&registry(), &files.invocation), 0);
        assert_matches!(
            response(&files),
            WorkerResponse::Failed { error } if error.contains("Unknown job type")
        );
    }

    #[test]
    fn unsupported_version() {
        let files = files(
            "text_to_image",
            Some(json!({"version": 99, "job_type": "text_to_image", "accelerator_index": 0})),
        );

        assert_eq!(run_child(&registry(), &files.invocation), 0);
        assert_matches!(
            response(&files),
            WorkerResponse::Failed { error } if error.contains("Unsupported protocol version 99")
        );
    }

    #[test]
    fn missing_request_file() {
        let files = files("text_to_image", None);

        assert_eq!(run_child(&registry(), &files.invocation), 0);
        assert_matches!(
            response(&files),
            WorkerResponse::Failed { error } if error.starts_with("Failed to load job arguments")
        );
    }

    #[test]
    fn unwritable_response() {
        let mut files = files(
            "text_to_image",
            Some(request("text_to_image", Arguments::new())),
        );
        files.invocation.response_file = files
            .invocation
            .request_file
            .with_file_name("missing")
            .join("response.json");

        assert_eq!(
            run_child(&registry(), &files.invocation),
            EXIT_RESPONSE_FAILED
        );
    }
}
