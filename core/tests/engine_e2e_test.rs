mod common;

use common::*;
use evertask::config::{EverTaskConfig, QueueConfig};
use evertask::engine::EverTask;
use evertask::queue::QueueFullBehavior;
use evertask::schedule::RecurringSchedule;
use evertask::storage::{InMemoryTaskStorage, TaskStorage};
use evertask::task::TaskStatus;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn small_engine(storage: Arc<InMemoryTaskStorage>) -> EverTask {
    let config = EverTaskConfig::builder()
        .max_degree_of_parallelism(4)
        .channel_capacity(64)
        .build();
    EverTask::with_storage(config, storage).expect("engine builds")
}

#[tokio::test(flavor = "multi_thread")]
async fn immediate_dispatch_runs_to_completed_with_full_audit() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let engine = small_engine(storage.clone());
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    let id = engine
        .dispatch(&Echo {
            message: "hello".into(),
        })
        .await
        .expect("dispatches");

    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await,
        "handler never ran"
    );
    assert!(
        wait_for_status(&storage, &id, TaskStatus::Completed, Duration::from_secs(5)).await,
        "task never completed"
    );

    let audit = storage.audit_trail(&id).await.expect("audit");
    let statuses: Vec<TaskStatus> = audit.iter().map(|row| row.status).collect();
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::Completed,
        ]
    );

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn delayed_dispatch_stays_pending_until_due() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let engine = small_engine(storage.clone());
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    let before = chrono::Utc::now();
    let id = engine
        .dispatch_in(
            &Echo {
                message: "later".into(),
            },
            Duration::from_millis(500),
        )
        .await
        .expect("dispatches");

    // Well before the due instant the task is still pending with its instant recorded
    tokio::time::sleep(Duration::from_millis(100)).await;
    let row = storage.get(&id).await.expect("reads").expect("row exists");
    assert_eq!(row.status, TaskStatus::Pending);
    let scheduled = row.scheduled_execution.expect("has an instant");
    let offset = (scheduled - before).num_milliseconds();
    assert!((400..=700).contains(&offset), "offset was {offset}ms");
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await,
        "delayed task never ran"
    );

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recurring_series_honors_max_runs() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let engine = small_engine(storage.clone());
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    let schedule = RecurringSchedule::every_seconds(1)
        .starting_now()
        .with_max_runs(3);
    engine
        .dispatch_recurring(
            &Echo {
                message: "tick".into(),
            },
            schedule,
        )
        .await
        .expect("dispatches");

    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) >= 3, Duration::from_secs(10)).await,
        "series never reached three runs"
    );
    // The cap is a lifetime cap, a fourth run must never appear
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idempotent_key_collapses_live_dispatches() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let engine = small_engine(storage.clone());
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    let far = Duration::from_secs(3600);
    let request = Echo {
        message: "cleanup".into(),
    };

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = engine
            .dispatch_with(
                &request,
                evertask::DispatchMode::Delay(far),
                Some("cleanup".into()),
            )
            .await
            .expect("dispatches");
        ids.push(id);
    }
    assert_eq!(ids[0], ids[1]);
    assert_eq!(ids[1], ids[2]);
    assert_eq!(storage.len(), 1);

    // Once the row is terminal, the same key starts a fresh logical task
    engine.cancel(ids[0]).await.expect("cancels");
    let new_id = engine
        .dispatch_with(
            &request,
            evertask::DispatchMode::Delay(far),
            Some("cleanup".into()),
        )
        .await
        .expect("dispatches");
    assert_ne!(new_id, ids[0]);
    let row = storage.get(&new_id).await.expect("reads").expect("row exists");
    assert_eq!(row.status, TaskStatus::Pending);
    assert_eq!(row.task_key.as_deref(), Some("cleanup"));
    assert_eq!(storage.len(), 1);

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_full_reject_surfaces_to_the_producer() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let config = EverTaskConfig::builder()
        .queue(
            "default",
            QueueConfig::builder()
                .capacity(2)
                .full_behavior(QueueFullBehavior::Reject)
                .build(),
        )
        .build();
    let engine = EverTask::with_storage(config, storage).expect("engine builds");
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    // The engine is intentionally not started: nothing drains the queue, so the
    // third dispatch must observe a full channel deterministically

    let request = Echo {
        message: "burst".into(),
    };
    engine.dispatch(&request).await.expect("first fits");
    engine.dispatch(&request).await.expect("second fits");
    let third = engine.dispatch(&request).await;
    assert!(matches!(
        third,
        Err(evertask::EverTaskError::QueueFull { .. })
    ));

    // Started late, the two accepted tasks complete normally
    engine.start().await.expect("starts");
    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) == 2, Duration::from_secs(5)).await,
        "accepted tasks never ran"
    );
    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn full_queue_falls_back_to_default() {
    struct SideQueueHandler {
        runs: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl evertask::task::TaskHandler for SideQueueHandler {
        type Request = Echo;

        async fn handle(
            &self,
            _request: Echo,
            _ctx: evertask::task::ExecutionContext,
        ) -> Result<(), evertask::task::HandlerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn queue_name(&self) -> Option<&str> {
            Some("narrow")
        }
    }

    let storage = Arc::new(InMemoryTaskStorage::new());
    let config = EverTaskConfig::builder()
        .queue(
            "narrow",
            QueueConfig::builder()
                .capacity(1)
                .full_behavior(QueueFullBehavior::FallbackToDefault)
                .build(),
        )
        .build();
    let engine = EverTask::with_storage(config, storage).expect("engine builds");
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || SideQueueHandler {
        runs: counter.clone(),
    });

    let request = Echo {
        message: "overflow".into(),
    };
    // Not started: the first dispatch fills the narrow queue, the second hops over
    engine.dispatch(&request).await.expect("fills the queue");
    engine.dispatch(&request).await.expect("falls back to default");

    engine.start().await.expect("starts");
    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) == 2, Duration::from_secs(5)).await,
        "fallback task never ran"
    );
    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_events_reach_subscribers_and_panics_stay_contained() {
    use evertask::monitoring::{TaskEventSubscriber, TaskLifecycleEvent};

    struct PanickingSubscriber;

    #[async_trait::async_trait]
    impl TaskEventSubscriber for PanickingSubscriber {
        async fn on_event(&self, _event: TaskLifecycleEvent) {
            panic!("misbehaving subscriber");
        }
    }

    let storage = Arc::new(InMemoryTaskStorage::new());
    let engine = small_engine(storage);
    let events = Arc::new(Mutex::new(Vec::new()));
    engine.subscribe(Arc::new(CollectingSubscriber {
        events: events.clone(),
    }));
    engine.subscribe(Arc::new(PanickingSubscriber));

    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    engine
        .dispatch(&Echo {
            message: "observed".into(),
        })
        .await
        .expect("dispatches");

    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) == 1, Duration::from_secs(5)).await,
        "handler never ran despite panicking subscriber"
    );
    assert!(
        wait_until(
            || {
                use evertask::monitoring::TaskLifecycleEvent as Event;
                let seen = events.lock().expect("events lock");
                seen.iter().any(|e| matches!(e, Event::Dispatched { .. }))
                    && seen.iter().any(|e| matches!(e, Event::Queued { .. }))
                    && seen.iter().any(|e| matches!(e, Event::Started { .. }))
                    && seen.iter().any(|e| matches!(e, Event::Completed { .. }))
            },
            Duration::from_secs(5)
        )
        .await,
        "subscriber missed lifecycle events"
    );

    engine.stop(Duration::from_secs(5)).await;
}
