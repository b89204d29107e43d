use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::task::{CancelReason, FailureDetail, TaskId};

#[allow(unused_imports)]
use crate::engine::EverTask;

/// [`TaskLifecycleEvent`] is the monitoring fan-out payload, one variant per observable
/// transition of a task. Events mirror the audit trail but are delivered in-process and
/// fire-and-forget, they are a window and not a ledger
#[derive(Debug, Clone)]
pub enum TaskLifecycleEvent {
    /// A dispatch was accepted and persisted
    Dispatched {
        id: TaskId,
        request_type: String,
        at: DateTime<Utc>,
    },
    /// The task entered an execution queue
    Queued {
        id: TaskId,
        queue: String,
        at: DateTime<Utc>,
    },
    /// A worker began executing the task
    Started { id: TaskId, at: DateTime<Utc> },
    /// The run finished successfully
    Completed { id: TaskId, at: DateTime<Utc> },
    /// Retries were exhausted, the run timed out, or the record could not be recovered
    Failed {
        id: TaskId,
        reason: FailureDetail,
        at: DateTime<Utc>,
    },
    /// The task was cancelled before or during execution
    Cancelled {
        id: TaskId,
        reason: CancelReason,
        at: DateTime<Utc>,
    },
    /// An attempt failed and another one follows after the delay
    Retried {
        id: TaskId,
        attempt: u32,
        error: String,
        delay: Duration,
        at: DateTime<Utc>,
    },
    /// A recurring series skipped occurrences that fell into the past
    OccurrencesSkipped {
        id: TaskId,
        count: u64,
        at: DateTime<Utc>,
    },
}

impl TaskLifecycleEvent {
    /// The id of the task the event concerns
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskLifecycleEvent::Dispatched { id, .. }
            | TaskLifecycleEvent::Queued { id, .. }
            | TaskLifecycleEvent::Started { id, .. }
            | TaskLifecycleEvent::Completed { id, .. }
            | TaskLifecycleEvent::Failed { id, .. }
            | TaskLifecycleEvent::Cancelled { id, .. }
            | TaskLifecycleEvent::Retried { id, .. }
            | TaskLifecycleEvent::OccurrencesSkipped { id, .. } => *id,
        }
    }
}

/// [`TaskEventSubscriber`] receives lifecycle events. Subscribers run on their own
/// spawned tasks, a slow or failing subscriber can never stall or crash an executor
///
/// # See Also
/// - [`TaskEventPublisher`]
/// - [`EverTask`]
#[async_trait]
pub trait TaskEventSubscriber: Send + Sync + 'static {
    async fn on_event(&self, event: TaskLifecycleEvent);
}

/// [`TaskEventPublisher`] fans lifecycle events out to the registered subscribers.
///
/// The subscriber list sits under a read-mostly lock (subscriptions happen at startup,
/// reads on every event). Delivery is strictly fire-and-forget: each subscriber gets its
/// own spawned task and a panic inside one is captured and logged, never propagated
/// into the emitting executor
///
/// # See Also
/// - [`TaskEventSubscriber`]
/// - [`TaskLifecycleEvent`]
pub struct TaskEventPublisher {
    subscribers: RwLock<Vec<Arc<dyn TaskEventSubscriber>>>,
}

impl Default for TaskEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskEventPublisher {
    /// Creates / Constructs a publisher with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a subscriber for every event emitted from now on
    pub fn subscribe(&self, subscriber: Arc<dyn TaskEventSubscriber>) {
        self.subscribers
            .write()
            .expect("subscriber list lock poisoned")
            .push(subscriber);
    }

    /// The number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .expect("subscriber list lock poisoned")
            .len()
    }

    /// Emits one event to every subscriber, fire-and-forget. Returns immediately, the
    /// deliveries run on their own tasks
    pub fn emit(&self, event: TaskLifecycleEvent) {
        let subscribers = {
            self.subscribers
                .read()
                .expect("subscriber list lock poisoned")
                .clone()
        };
        if subscribers.is_empty() {
            return;
        }
        for subscriber in subscribers {
            let event = event.clone();
            let delivery = tokio::spawn(async move {
                subscriber.on_event(event).await;
            });
            // A second task observes the delivery so a subscriber panic is captured
            // and logged instead of silently vanishing with the dropped handle
            tokio::spawn(async move {
                if let Err(err) = delivery.await
                    && err.is_panic()
                {
                    tracing::error!(%err, "monitoring subscriber panicked");
                }
            });
        }
    }
}
