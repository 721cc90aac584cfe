//! Test suite for ensuring a correct implementation of a history gateway.
use chrono::{SubsecRound, TimeDelta, Utc};

use crate::job::{JobId, JobStatus};

use super::{HistoryEntry, HistoryError, HistoryGateway, HistoryUpdate};

#[doc(hidden)]
pub fn sample_entry() -> HistoryEntry {
    HistoryEntry {
        job_id: JobId::new(),
        owner: Some(7),
        job_type: "text_to_image".to_owned(),
        prompt: Some("a red bicycle".to_owned()),
        negative_prompt: None,
        parameters: serde_json::json!({"steps": 30, "width": 512}),
        status: JobStatus::Pending,
        result_location: None,
        result_name: None,
        error_message: None,
        // Databases may not keep nanoseconds.
        created_at: Utc::now().trunc_subsecs(3),
        started_at: None,
        completed_at: None,
        execution_time: None,
    }
}

fn completed_update(entry: &HistoryEntry) -> HistoryUpdate {
    let started_at = entry.created_at + TimeDelta::seconds(1);
    HistoryUpdate {
        status: JobStatus::Completed,
        started_at: Some(started_at),
        completed_at: Some(started_at + TimeDelta::milliseconds(2500)),
        result_location: Some("/data/outputs/bicycle.png".to_owned()),
        result_name: Some("bicycle.png".to_owned()),
        error_message: None,
        execution_time: Some(2.5),
    }
}

/// Create test suite for a history gateway.
///
/// For gateway implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use accelq::history_test_suite;
/// use accelq::history::memory::InMemoryHistory;
/// history_test_suite!(for: InMemoryHistory::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use accelq::history_test_suite;
/// history_test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     gateway: GatewayImplementation::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! history_test_suite {
    (for: $gateway:expr) => {
        $crate::history_test_suite!(attr: tokio::test, args: (), gateway: $gateway);
    };
    (attr: $attr:meta, args: $args:tt, gateway: $gateway:expr) => {
        #[$attr]
        async fn insert_then_find $args {
          let gateway = $gateway;
          $crate::history::testing::insert_then_find(gateway).await;
        }
        #[$attr]
        async fn insert_is_idempotent $args {
          let gateway = $gateway;
          $crate::history::testing::insert_is_idempotent(gateway).await;
        }
        #[$attr]
        async fn update_applies_fields $args {
          let gateway = $gateway;
          $crate::history::testing::update_applies_fields(gateway).await;
        }
        #[$attr]
        async fn update_is_idempotent $args {
          let gateway = $gateway;
          $crate::history::testing::update_is_idempotent(gateway).await;
        }
        #[$attr]
        async fn update_keeps_unset_fields $args {
          let gateway = $gateway;
          $crate::history::testing::update_keeps_unset_fields(gateway).await;
        }
        #[$attr]
        async fn update_not_found $args {
          let gateway = $gateway;
          $crate::history::testing::update_not_found(gateway).await;
        }
        #[$attr]
        async fn find_not_found $args {
          let gateway = $gateway;
          $crate::history::testing::find_not_found(gateway).await;
        }
        #[$attr]
        async fn concurrent_inserts $args {
          let gateway = $gateway;
          $crate::history::testing::concurrent_inserts(gateway).await;
        }
    };
}

#[doc(hidden)]
pub async fn insert_then_find(gateway: impl HistoryGateway) {
    let entry = sample_entry();

    gateway.insert(entry.clone()).await.unwrap();

    assert_eq!(gateway.find_by_id(entry.job_id).await.unwrap(), Some(entry));
}

#[doc(hidden)]
pub async fn insert_is_idempotent(gateway: impl HistoryGateway) {
    let entry = sample_entry();
    gateway.insert(entry.clone()).await.unwrap();

    let duplicate = HistoryEntry {
        job_type: "image_edit".to_owned(),
        ..entry.clone()
    };
    assert!(gateway.insert(duplicate).await.is_ok());

    assert_eq!(gateway.find_by_id(entry.job_id).await.unwrap(), Some(entry));
}

#[doc(hidden)]
pub async fn update_applies_fields(gateway: impl HistoryGateway) {
    let entry = sample_entry();
    gateway.insert(entry.clone()).await.unwrap();
    let update = completed_update(&entry);

    gateway.update(entry.job_id, update.clone()).await.unwrap();

    let mut expected = entry.clone();
    expected.apply(&update);
    let found = gateway.find_by_id(entry.job_id).await.unwrap().unwrap();
    assert_eq!(found, expected);
    assert_eq!(found.status, JobStatus::Completed);
}

#[doc(hidden)]
pub async fn update_is_idempotent(gateway: impl HistoryGateway) {
    let entry = sample_entry();
    gateway.insert(entry.clone()).await.unwrap();
    let update = completed_update(&entry);

    gateway.update(entry.job_id, update.clone()).await.unwrap();
    let once = gateway.find_by_id(entry.job_id).await.unwrap();
    gateway.update(entry.job_id, update).await.unwrap();
    let twice = gateway.find_by_id(entry.job_id).await.unwrap();

    assert_eq!(once, twice);
}

#[doc(hidden)]
pub async fn update_keeps_unset_fields(gateway: impl HistoryGateway) {
    let entry = sample_entry();
    gateway.insert(entry.clone()).await.unwrap();
    let started_at = entry.created_at + TimeDelta::seconds(1);
    gateway
        .update(
            entry.job_id,
            HistoryUpdate {
                started_at: Some(started_at),
                ..HistoryUpdate::new(JobStatus::Running)
            },
        )
        .await
        .unwrap();

    gateway
        .update(
            entry.job_id,
            HistoryUpdate {
                error_message: Some("out of memory".to_owned()),
                ..HistoryUpdate::new(JobStatus::Failed)
            },
        )
        .await
        .unwrap();

    let found = gateway.find_by_id(entry.job_id).await.unwrap().unwrap();
    assert_eq!(found.status, JobStatus::Failed);
    assert_eq!(found.started_at, Some(started_at));
    assert_eq!(found.error_message.as_deref(), Some("out of memory"));
    assert_eq!(found.result_location, None);
}

#[doc(hidden)]
pub async fn update_not_found(gateway: impl HistoryGateway) {
    let job_id = JobId::new();
    assert!(matches!(
        gateway
            .update(job_id, HistoryUpdate::new(JobStatus::Running))
            .await,
        Err(HistoryError::JobNotFound(id)) if id == job_id
    ));
}

#[doc(hidden)]
pub async fn find_not_found(gateway: impl HistoryGateway) {
    assert!(matches!(gateway.find_by_id(JobId::new()).await, Ok(None)));
}

#[doc(hidden)]
pub async fn concurrent_inserts(gateway: impl HistoryGateway) {
    let entries = (0..8).map(|_| sample_entry()).collect::<Vec<_>>();

    let results =
        futures::future::join_all(entries.iter().cloned().map(|entry| gateway.insert(entry)))
            .await;

    assert!(results.iter().all(Result::is_ok));
    for entry in entries {
        assert_eq!(gateway.find_by_id(entry.job_id).await.unwrap(), Some(entry));
    }
}
