//! The file based handoff between the coordinator and an isolated child process.
//!
//! The parent writes a [`WorkerRequest`] as JSON to the request file, the child writes a
//! [`WorkerResponse`] as JSON to the response file:
//!
//! ```json
//! {"version": 1, "job_type": "text_to_image", "accelerator_index": 0,
//!  "args": [], "kwargs": {"prompt": "a cat", "_accelerator_index": 0}}
//! ```
//!
//! ```json
//! {"status": "completed", "result": {"result_location": "/out/a.png", "media_kind": "image/png", "display_name": "a.png"}}
//! {"status": "failed", "error": "CUDA out of memory"}
//! ```
use serde::{Deserialize, Serialize};

use crate::{job::ResultPayload, routine::Arguments};

/// The protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub version: u32,
    pub job_type: String,
    pub accelerator_index: usize,
    #[serde(flatten)]
    pub arguments: Arguments,
}

impl WorkerRequest {
    pub fn new(
        job_type: impl Into<String>,
        accelerator_index: usize,
        arguments: Arguments,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            job_type: job_type.into(),
            accelerator_index,
            arguments,
        }
    }

    pub fn is_supported(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum WorkerResponse {
    Completed { result: ResultPayload },
    Failed { error: String },
}

impl WorkerResponse {
    pub fn failed(error: impl ToString) -> Self {
        Self::Failed {
            error: error.to_string(),
        }
    }
}

impl From<Result<ResultPayload, String>> for WorkerResponse {
    fn from(value: Result<ResultPayload, String>) -> Self {
        match value {
            Ok(result) => Self::Completed { result },
            Err(error) => Self::Failed { error },
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_shape() {
        let request = WorkerRequest::new(
            "text_to_image",
            1,
            Arguments::new()
                .with_arg(4)
                .with_kwarg("prompt", "a cat")
                .with_kwarg("_accelerator_index", 1),
        );

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "version": 1,
                "job_type": "text_to_image",
                "accelerator_index": 1,
                "args": [4],
                "kwargs": {"prompt": "a cat", "_accelerator_index": 1},
            })
        );
    }

    #[test]
    fn request_without_arguments() {
        let request: WorkerRequest = serde_json::from_value(json!({
            "version": 2,
            "job_type": "image_edit",
            "accelerator_index": 0,
        }))
        .unwrap();

        assert_eq!(request.arguments, Arguments::new());
        assert!(!request.is_supported());
    }

    #[test]
    fn response_shapes() {
        let completed: WorkerResponse = serde_json::from_value(json!({
            "status": "completed",
            "result": {
                "result_location": "/out/a.png",
                "media_kind": "image/png",
                "display_name": "a.png",
            },
        }))
        .unwrap();
        assert_eq!(
            completed,
            WorkerResponse::Completed {
                result: ResultPayload::new("/out/a.png", "image/png", "a.png")
            }
        );

        assert_eq!(
            serde_json::to_value(WorkerResponse::failed("CUDA out of memory")).unwrap(),
            json!({"status": "failed", "error": "CUDA out of memory"})
        );
        assert!(serde_json::from_value::<WorkerResponse>(json!({"status": "running"})).is_err());
    }
}
