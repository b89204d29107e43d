#![allow(dead_code)]

use async_trait::async_trait;
use evertask::monitoring::{TaskEventSubscriber, TaskLifecycleEvent};
use evertask::retry::RetryPolicy;
use evertask::task::{ExecutionContext, HandlerError, TaskHandler, TaskRequest};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub message: String,
}

impl TaskRequest for Echo {
    fn request_type() -> &'static str {
        "test.echo"
    }
}

/// Counts its runs, succeeds immediately
#[derive(Default)]
pub struct EchoHandler {
    pub runs: Arc<AtomicU32>,
}

impl EchoHandler {
    pub fn with_counter(runs: Arc<AtomicU32>) -> Self {
        Self { runs }
    }
}

#[async_trait]
impl TaskHandler for EchoHandler {
    type Request = Echo;

    async fn handle(&self, _request: Echo, _ctx: ExecutionContext) -> Result<(), HandlerError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flaky {
    pub succeed_on_attempt: u32,
}

impl TaskRequest for Flaky {
    fn request_type() -> &'static str {
        "test.flaky"
    }
}

/// Fails until the configured attempt is reached, recording every retry callback
pub struct FlakyHandler {
    pub attempts: Arc<AtomicU32>,
    pub retries_seen: Arc<Mutex<Vec<u32>>>,
    pub policy: RetryPolicy,
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    type Request = Flaky;

    async fn handle(&self, request: Flaky, _ctx: ExecutionContext) -> Result<(), HandlerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < request.succeed_on_attempt {
            return Err(format!("attempt {attempt} failed").into());
        }
        Ok(())
    }

    async fn on_retry(
        &self,
        _ctx: &ExecutionContext,
        attempt: u32,
        _error: &HandlerError,
        _delay: Duration,
    ) {
        self.retries_seen
            .lock()
            .expect("retries lock poisoned")
            .push(attempt);
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(self.policy.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nap {
    pub millis: u64,
}

impl TaskRequest for Nap {
    fn request_type() -> &'static str {
        "test.nap"
    }
}

/// Sleeps for the requested duration, honoring cancellation
#[derive(Default)]
pub struct NapHandler {
    pub completed: Arc<AtomicU32>,
    pub timeout: Option<Duration>,
}

#[async_trait]
impl TaskHandler for NapHandler {
    type Request = Nap;

    async fn handle(&self, request: Nap, ctx: ExecutionContext) -> Result<(), HandlerError> {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(request.millis)) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            _ = ctx.cancellation_token().cancelled() => {
                Err("interrupted".into())
            }
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Collects every lifecycle event it sees
#[derive(Default)]
pub struct CollectingSubscriber {
    pub events: Arc<Mutex<Vec<TaskLifecycleEvent>>>,
}

#[async_trait]
impl TaskEventSubscriber for CollectingSubscriber {
    async fn on_event(&self, event: TaskLifecycleEvent) {
        self.events.lock().expect("events lock poisoned").push(event);
    }
}

/// Polls `condition` until it holds or `timeout` elapses, returning whether it held
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Polls storage until the task reaches `status` or `timeout` elapses
pub async fn wait_for_status(
    storage: &std::sync::Arc<evertask::storage::InMemoryTaskStorage>,
    id: &evertask::task::TaskId,
    status: evertask::task::TaskStatus,
    timeout: Duration,
) -> bool {
    use evertask::storage::TaskStorage;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = storage.get(id).await.ok().flatten().map(|row| row.status);
        if current == Some(status) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
