mod common;

use chrono::{Duration as TimeDelta, Utc};
use common::*;
use evertask::config::EverTaskConfig;
use evertask::engine::EverTask;
use evertask::schedule::RecurringSchedule;
use evertask::storage::{InMemoryTaskStorage, TaskStorage};
use evertask::task::{AuditLevel, PersistedTask, TaskId, TaskStatus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn pending_row(request_type: &str, payload: String, status: TaskStatus) -> PersistedTask {
    PersistedTask {
        id: TaskId::generate(),
        task_key: None,
        request_type: request_type.to_string(),
        request_payload: payload,
        handler_type: "recovered".to_string(),
        queue_name: None,
        status,
        created_at: Utc::now(),
        scheduled_execution: None,
        recurring: None,
        current_run_count: 0,
        next_run: None,
        audit_level: AuditLevel::Full,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unfinished_tasks_resume_after_a_restart() {
    let storage = Arc::new(InMemoryTaskStorage::new());

    // What a previous process left behind: one never-started task and one that was
    // mid-run when the process died
    let pending = pending_row(
        "test.echo",
        serde_json::to_string(&Echo {
            message: "survivor".into(),
        })
        .expect("serializes"),
        TaskStatus::Pending,
    );
    let interrupted = pending_row(
        "test.echo",
        serde_json::to_string(&Echo {
            message: "crashed mid-run".into(),
        })
        .expect("serializes"),
        TaskStatus::InProgress,
    );
    storage.persist(pending.clone()).await.expect("persists");
    storage.persist(interrupted.clone()).await.expect("persists");

    let engine =
        EverTask::with_storage(EverTaskConfig::builder().build(), storage.clone())
            .expect("engine builds");
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) == 2, Duration::from_secs(5)).await,
        "recovered tasks never ran"
    );
    assert!(
        wait_for_status(&storage, &pending.id, TaskStatus::Completed, Duration::from_secs(5))
            .await
    );
    assert!(
        wait_for_status(
            &storage,
            &interrupted.id,
            TaskStatus::Completed,
            Duration::from_secs(5)
        )
        .await
    );

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unresolvable_records_are_marked_failed_not_crashed() {
    let storage = Arc::new(InMemoryTaskStorage::new());

    let orphaned = pending_row(
        "test.forgotten_type",
        serde_json::to_string(&Echo {
            message: "orphan".into(),
        })
        .expect("serializes"),
        TaskStatus::Pending,
    );
    let garbled = pending_row("test.echo", "{not json at all".to_string(), TaskStatus::Pending);
    let healthy = pending_row(
        "test.echo",
        serde_json::to_string(&Echo {
            message: "fine".into(),
        })
        .expect("serializes"),
        TaskStatus::Pending,
    );
    storage.persist(orphaned.clone()).await.expect("persists");
    storage.persist(garbled.clone()).await.expect("persists");
    storage.persist(healthy.clone()).await.expect("persists");

    let engine =
        EverTask::with_storage(EverTaskConfig::builder().build(), storage.clone())
            .expect("engine builds");
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    // The broken records fail with a reason, the healthy one still runs
    assert!(
        wait_for_status(&storage, &orphaned.id, TaskStatus::Failed, Duration::from_secs(5)).await
    );
    assert!(
        wait_for_status(&storage, &garbled.id, TaskStatus::Failed, Duration::from_secs(5)).await
    );
    assert!(
        wait_for_status(&storage, &healthy.id, TaskStatus::Completed, Duration::from_secs(5))
            .await
    );

    let audit = storage.audit_trail(&orphaned.id).await.expect("audit");
    let failed = audit
        .iter()
        .find(|entry| entry.status == TaskStatus::Failed)
        .expect("failure audit row");
    assert!(
        failed
            .failure
            .as_ref()
            .expect("carries detail")
            .message
            .contains("no handler registered")
    );

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recurring_series_resumes_on_rhythm_after_downtime() {
    let storage = Arc::new(InMemoryTaskStorage::new());

    // The series ran at t-13s and t-8s, the occurrence at t-3s was missed while the
    // service was down. On rhythm the next run lands at t+2s
    let missed = Utc::now() - TimeDelta::seconds(3);
    let mut row = pending_row(
        "test.echo",
        serde_json::to_string(&Echo {
            message: "heartbeat".into(),
        })
        .expect("serializes"),
        TaskStatus::Pending,
    );
    row.recurring = Some(RecurringSchedule::every_seconds(5));
    row.scheduled_execution = Some(missed);
    row.next_run = Some(missed);
    row.current_run_count = 2;
    storage.persist(row.clone()).await.expect("persists");

    let engine =
        EverTask::with_storage(EverTaskConfig::builder().build(), storage.clone())
            .expect("engine builds");
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    // The missed occurrence is recorded, not silently dropped
    assert!(
        wait_until(
            || !storage.skipped_occurrences(&row.id).is_empty(),
            Duration::from_secs(5)
        )
        .await,
        "skip record never written"
    );
    assert_eq!(storage.skipped_occurrences(&row.id), vec![missed]);

    // The rescheduled instant preserves the rhythm: missed + one interval
    let stored = storage.get(&row.id).await.expect("reads").expect("row exists");
    let next = stored.scheduled_execution.expect("rescheduled");
    assert_eq!(next, missed + TimeDelta::seconds(5));

    // And the run happens at that instant, roughly two seconds from now
    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) >= 1, Duration::from_secs(10)).await,
        "resumed series never ran"
    );

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recovery_pages_with_bounded_memory() {
    let storage = Arc::new(InMemoryTaskStorage::new());

    for n in 0..250 {
        let row = pending_row(
            "test.echo",
            serde_json::to_string(&Echo {
                message: format!("backlog {n}"),
            })
            .expect("serializes"),
            TaskStatus::Pending,
        );
        storage.persist(row).await.expect("persists");
    }

    // The keyset pages are bounded and strictly ordered by (created_at, id)
    let first = storage.retrieve_pending(None, 100).await.expect("page");
    assert_eq!(first.len(), 100);
    let mut cursors: Vec<_> = first.iter().map(|row| row.cursor()).collect();
    let mut sorted = cursors.clone();
    sorted.sort();
    assert_eq!(cursors, sorted);

    let second = storage
        .retrieve_pending(Some(first.last().expect("non-empty").cursor()), 100)
        .await
        .expect("page");
    assert_eq!(second.len(), 100);
    assert!(second.first().expect("non-empty").cursor() > first.last().expect("non-empty").cursor());
    cursors.extend(second.iter().map(|row| row.cursor()));

    let third = storage
        .retrieve_pending(Some(second.last().expect("non-empty").cursor()), 100)
        .await
        .expect("page");
    assert_eq!(third.len(), 50);

    // And the whole backlog drains through recovery
    let engine =
        EverTask::with_storage(EverTaskConfig::builder().build(), storage.clone())
            .expect("engine builds");
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) == 250, Duration::from_secs(15)).await,
        "backlog never drained, ran {} of 250",
        runs.load(Ordering::SeqCst)
    );

    engine.stop(Duration::from_secs(5)).await;
}
