pub mod manager;

pub use manager::{DEFAULT_QUEUE, QueueManager, RECURRING_QUEUE};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use crate::registry::ErasedTaskHandler;
use crate::retry::RetryPolicy;
use crate::task::PersistedTask;

#[allow(unused_imports)]
use crate::worker::WorkerPool;

/// What a producer experiences when a bounded queue is at capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QueueFullBehavior {
    /// Block the producer until a slot frees up
    #[default]
    Wait,
    /// Surface a queue-full error to the producer immediately
    Reject,
    /// Re-attempt the enqueue on the default queue, surfacing the reject only when the
    /// target already is the default (or the default is full too)
    FallbackToDefault,
}

/// One ready execution travelling from the dispatcher or scheduler to a worker. The
/// embedded [`PersistedTask`] is the snapshot taken when the run was scheduled, its
/// `scheduled_execution` is the drift anchor for recurring reschedules. The handler is
/// present when it was constructed eagerly at dispatch, absent when construction was
/// deferred to execution time
pub(crate) struct ExecutionItem {
    pub task: PersistedTask,
    pub handler: Option<Arc<dyn ErasedTaskHandler>>,
}

impl Clone for ExecutionItem {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// The outcome of pushing an item into a bounded queue
pub(crate) enum EnqueueOutcome {
    /// The item is in the queue
    Accepted,
    /// The queue was full, the item is handed back for fallback or error reporting
    Full(ExecutionItem),
    /// The consuming side is gone, the engine is shutting down
    Closed,
}

/// [`TaskQueue`] is one named bounded FIFO channel of ready executions together with its
/// consumption settings. Each queue is consumed by a fixed fan-out of long-lived workers
/// (see [`WorkerPool`]), the channel guarantees each item reaches exactly one of them.
///
/// Producers interact through [`TaskQueue::queue`] (which honors the configured
/// [`QueueFullBehavior`]) or [`TaskQueue::try_queue`] (always non-blocking, reports full
/// regardless of the policy)
///
/// # See Also
/// - [`QueueManager`]
/// - [`QueueFullBehavior`]
/// - [`WorkerPool`]
pub struct TaskQueue {
    name: String,
    capacity: usize,
    full_behavior: QueueFullBehavior,
    parallelism: usize,
    default_timeout: Option<Duration>,
    default_retry: Option<RetryPolicy>,
    tx: mpsc::Sender<ExecutionItem>,
    rx: Arc<Mutex<mpsc::Receiver<ExecutionItem>>>,
}

impl TaskQueue {
    pub(crate) fn new(
        name: impl Into<String>,
        capacity: usize,
        full_behavior: QueueFullBehavior,
        parallelism: usize,
        default_timeout: Option<Duration>,
        default_retry: Option<RetryPolicy>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            full_behavior,
            parallelism,
            default_timeout,
            default_retry,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// The queue's routing name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bounded capacity of the channel
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The configured overflow behavior
    pub fn full_behavior(&self) -> QueueFullBehavior {
        self.full_behavior
    }

    /// How many workers consume this queue
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// The per-queue execution timeout override, if any
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// The per-queue retry policy override, if any
    pub fn default_retry(&self) -> Option<&RetryPolicy> {
        self.default_retry.as_ref()
    }

    /// Policy-aware enqueue: waits under [`QueueFullBehavior::Wait`], otherwise behaves
    /// like [`TaskQueue::try_queue`] and leaves fallback to the caller
    pub(crate) async fn queue(&self, item: ExecutionItem) -> EnqueueOutcome {
        match self.full_behavior {
            QueueFullBehavior::Wait => match self.tx.send(item).await {
                Ok(()) => EnqueueOutcome::Accepted,
                Err(_) => EnqueueOutcome::Closed,
            },
            QueueFullBehavior::Reject | QueueFullBehavior::FallbackToDefault => {
                self.try_queue(item)
            }
        }
    }

    /// Blocking enqueue regardless of the configured overflow behavior. Used by the
    /// recovery pass, where dropping work is never acceptable and backpressure is the
    /// point
    pub(crate) async fn queue_wait(&self, item: ExecutionItem) -> EnqueueOutcome {
        match self.tx.send(item).await {
            Ok(()) => EnqueueOutcome::Accepted,
            Err(_) => EnqueueOutcome::Closed,
        }
    }

    /// Non-blocking enqueue, reports full immediately regardless of the configured
    /// overflow behavior
    pub(crate) fn try_queue(&self, item: ExecutionItem) -> EnqueueOutcome {
        match self.tx.try_send(item) {
            Ok(()) => EnqueueOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(item)) => EnqueueOutcome::Full(item),
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// The shared receiving end the queue's workers pull from
    pub(crate) fn receiver(&self) -> Arc<Mutex<mpsc::Receiver<ExecutionItem>>> {
        self.rx.clone()
    }
}
