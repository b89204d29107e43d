mod common;

use common::*;
use evertask::config::EverTaskConfig;
use evertask::engine::EverTask;
use evertask::errors::EverTaskError;
use evertask::schedule::RecurringSchedule;
use evertask::storage::{InMemoryTaskStorage, TaskStorage};
use evertask::task::TaskStatus;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_without_a_registered_handler_is_rejected() {
    let engine = EverTask::new(EverTaskConfig::builder().build()).expect("engine builds");
    let result = engine
        .dispatch(&Echo {
            message: "nobody listens".into(),
        })
        .await;
    assert!(matches!(result, Err(EverTaskError::NoHandlerRegistered(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_rejects_schedules_that_never_run() {
    let engine = EverTask::new(EverTaskConfig::builder().build()).expect("engine builds");
    engine.register::<EchoHandler>();

    let never = RecurringSchedule::every_seconds(5).with_max_runs(0);
    let result = engine
        .dispatch_recurring(
            &Echo {
                message: "stillborn".into(),
            },
            never,
        )
        .await;
    assert!(matches!(result, Err(EverTaskError::InvalidSchedule(_))));

    let malformed = RecurringSchedule::cron("61 * * * *");
    let result = engine
        .dispatch_recurring(
            &Echo {
                message: "bad cron".into(),
            },
            malformed,
        )
        .await;
    assert!(matches!(result, Err(EverTaskError::InvalidSchedule(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_persists_before_it_routes() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let engine = EverTask::with_storage(EverTaskConfig::builder().build(), storage.clone())
        .expect("engine builds");
    engine.register::<EchoHandler>();
    // Not started: the row must exist even though nothing will execute yet

    let id = engine
        .dispatch_in(
            &Echo {
                message: "durable first".into(),
            },
            Duration::from_secs(3600),
        )
        .await
        .expect("dispatches");

    let row = storage.get(&id).await.expect("reads").expect("row exists");
    assert_eq!(row.status, TaskStatus::Pending);
    assert_eq!(row.request_type, "test.echo");
    assert!(row.scheduled_execution.is_some());
    assert_eq!(row.current_run_count, 0);

    let restored: Echo = serde_json::from_str(&row.request_payload).expect("payload readable");
    assert_eq!(restored.message, "durable first");
}

#[tokio::test(flavor = "multi_thread")]
async fn keyed_redispatch_updates_scheduling_fields_in_place() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let engine = EverTask::with_storage(EverTaskConfig::builder().build(), storage.clone())
        .expect("engine builds");
    engine.register::<EchoHandler>();

    let first = engine
        .dispatch_with(
            &Echo {
                message: "v1".into(),
            },
            evertask::DispatchMode::Delay(Duration::from_secs(100)),
            Some("rolling".into()),
        )
        .await
        .expect("dispatches");
    let before = storage
        .get(&first)
        .await
        .expect("reads")
        .expect("row exists");

    let second = engine
        .dispatch_with(
            &Echo {
                message: "v2".into(),
            },
            evertask::DispatchMode::Delay(Duration::from_secs(2_000)),
            Some("rolling".into()),
        )
        .await
        .expect("dispatches");
    assert_eq!(first, second);

    let after = storage
        .get(&first)
        .await
        .expect("reads")
        .expect("row exists");
    // The scheduling fields moved, the identity and the run counter did not
    assert!(after.scheduled_execution > before.scheduled_execution);
    assert_eq!(after.current_run_count, before.current_run_count);
    assert_eq!(after.created_at, before.created_at);
    let restored: Echo = serde_json::from_str(&after.request_payload).expect("payload readable");
    assert_eq!(restored.message, "v2");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_of_an_unknown_task_reports_not_found() {
    let engine = EverTask::new(EverTaskConfig::builder().build()).expect("engine builds");
    let result = engine.cancel(evertask::task::TaskId::generate()).await;
    assert!(matches!(result, Err(EverTaskError::TaskNotFound(_))));
}
