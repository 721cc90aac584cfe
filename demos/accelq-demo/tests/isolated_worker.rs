use std::{path::Path, sync::Arc, time::Duration};

use accelq::prelude::*;

const WAIT: Option<Duration> = Some(Duration::from_secs(30));

/// A coordinator whose jobs run in the demo binary's worker subcommand.
async fn coordinator(temp_dir: &Path, output_dir: &Path) -> Coordinator {
    let strategy = IsolatedProcess::new(env!("CARGO_BIN_EXE_accelq-demo"))
        .with_args(["worker"])
        .with_env("ACCELQ__OUTPUT_DIR", output_dir.to_string_lossy())
        .with_env("RUST_LOG", "warn")
        .with_temp_dir(temp_dir)
        .with_job_timeout(Duration::from_secs(30));
    let coordinator = Coordinator::new(CoordinatorConfig {
        execution_mode: ExecutionMode::Isolated,
        accelerators: Some(1),
        max_workers: 1,
        poll_interval_ms: 10,
        ..Default::default()
    })
    .with_strategy(strategy);
    coordinator.start().await;
    coordinator
}

/// Only the job type of the parent side routine reaches the child.
fn parent_routine(job_type: &str) -> Arc<dyn ComputeRoutine> {
    Arc::new(accelq::routine::from_fn(job_type, |_| {
        Err(RoutineError::new("ran in the coordinator process"))
    }))
}

#[tokio::test]
async fn failing_routine_reports_its_error() {
    let temp_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(temp_dir.path(), output_dir.path()).await;

    let job = coordinator
        .submit(
            parent_routine("image_edit"),
            Arguments::new(),
            JobMetadata::new("image_edit"),
        )
        .await
        .unwrap();
    let record = coordinator.get_result(job, WAIT).await.unwrap();

    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("A source image is required"));
    assert_eq!(record.result, None);
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn completed_routine_writes_its_output() {
    let temp_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(temp_dir.path(), output_dir.path()).await;

    let job = coordinator
        .submit(
            parent_routine("text_to_image"),
            Arguments::new()
                .with_kwarg("prompt", "a fox in the snow")
                .with_kwarg("width", 4)
                .with_kwarg("height", 4),
            JobMetadata::new("text_to_image"),
        )
        .await
        .unwrap();
    let record = coordinator.get_result(job, WAIT).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed, "{:?}", record.error);
    let result = record.result.unwrap();
    assert_eq!(result.media_kind, "image/x-portable-pixmap");
    assert!(result.display_name.starts_with("a-fox-in-the-snow-"));
    assert!(Path::new(&result.result_location).starts_with(output_dir.path()));
    assert!(Path::new(&result.result_location).exists());
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    coordinator.stop().await.unwrap();
}
