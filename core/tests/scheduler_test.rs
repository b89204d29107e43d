mod common;

use async_trait::async_trait;
use common::*;
use evertask::config::EverTaskConfig;
use evertask::engine::EverTask;
use evertask::storage::InMemoryTaskStorage;
use evertask::task::{ExecutionContext, HandlerError, TaskHandler};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records the order in which its requests execute
struct OrderingHandler {
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TaskHandler for OrderingHandler {
    type Request = Echo;

    async fn handle(&self, request: Echo, _ctx: ExecutionContext) -> Result<(), HandlerError> {
        self.order
            .lock()
            .expect("order lock poisoned")
            .push(request.message);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn due_tasks_fire_in_time_order_regardless_of_dispatch_order() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let config = EverTaskConfig::builder()
        // A single worker keeps completion order equal to dequeue order
        .max_degree_of_parallelism(1)
        .build();
    let engine = EverTask::with_storage(config, storage).expect("engine builds");
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_c = order.clone();
    engine.register_with(move || OrderingHandler {
        order: order_c.clone(),
    });
    engine.start().await.expect("starts");

    // Dispatched later-first, must still run earlier-first
    engine
        .dispatch_in(
            &Echo {
                message: "second".into(),
            },
            Duration::from_millis(600),
        )
        .await
        .expect("dispatches");
    engine
        .dispatch_in(
            &Echo {
                message: "first".into(),
            },
            Duration::from_millis(200),
        )
        .await
        .expect("dispatches");

    assert!(
        wait_until(
            || order.lock().expect("order lock").len() == 2,
            Duration::from_secs(5)
        )
        .await,
        "delayed tasks never ran"
    );
    assert_eq!(*order.lock().expect("order lock"), vec!["first", "second"]);

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn a_sharded_scheduler_delivers_every_task() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let config = EverTaskConfig::builder().scheduler_shards(8).build();
    let engine = EverTask::with_storage(config, storage).expect("engine builds");
    let runs = Arc::new(AtomicU32::new(0));
    let counter = runs.clone();
    engine.register_with(move || EchoHandler::with_counter(counter.clone()));
    engine.start().await.expect("starts");

    // Ids hash across all shards, every shard must deliver
    for n in 0..40 {
        engine
            .dispatch_in(
                &Echo {
                    message: format!("sharded {n}"),
                },
                Duration::from_millis(100 + (n % 7) * 40),
            )
            .await
            .expect("dispatches");
    }

    assert!(
        wait_until(|| runs.load(Ordering::SeqCst) == 40, Duration::from_secs(10)).await,
        "sharded scheduler lost tasks, delivered {} of 40",
        runs.load(Ordering::SeqCst)
    );

    engine.stop(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn an_earlier_insertion_interrupts_a_long_idle() {
    let storage = Arc::new(InMemoryTaskStorage::new());
    let config = EverTaskConfig::builder().max_degree_of_parallelism(1).build();
    let engine = EverTask::with_storage(config, storage).expect("engine builds");
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_c = order.clone();
    engine.register_with(move || OrderingHandler {
        order: order_c.clone(),
    });
    engine.start().await.expect("starts");

    // The loop goes to sleep against a far-future instant first
    engine
        .dispatch_in(
            &Echo {
                message: "distant".into(),
            },
            Duration::from_secs(3600),
        )
        .await
        .expect("dispatches");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A much earlier task must wake the sleeping loop rather than wait an hour
    engine
        .dispatch_in(
            &Echo {
                message: "soon".into(),
            },
            Duration::from_millis(200),
        )
        .await
        .expect("dispatches");

    assert!(
        wait_until(
            || order.lock().expect("order lock").contains(&"soon".to_string()),
            Duration::from_secs(5)
        )
        .await,
        "wake-up signal never interrupted the idle"
    );

    engine.stop(Duration::from_secs(5)).await;
}
