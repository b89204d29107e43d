use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::EverTaskError;
use crate::queue::{EnqueueOutcome, ExecutionItem, QueueFullBehavior, TaskQueue};

#[allow(unused_imports)]
use crate::dispatcher::Dispatcher;

/// The queue every engine always has, the routing fallback of last resort
pub const DEFAULT_QUEUE: &str = "default";

/// The conventional queue for recurring work. When it exists, recurring tasks without an
/// explicit queue are routed onto it so one-off bursts cannot starve periodic work
pub const RECURRING_QUEUE: &str = "recurring";

/// [`QueueManager`] owns the named queues and routes ready executions onto them.
///
/// # Routing
/// In order: the explicit queue name carried by the task (falling back to the default
/// with a warning when the name is unknown), then [`RECURRING_QUEUE`] for recurring
/// tasks when that queue exists, then [`DEFAULT_QUEUE`].
///
/// # Overflow
/// [`QueueManager::enqueue`] honors the target queue's [`QueueFullBehavior`], including
/// the fallback hop onto the default queue. The fallback attempt itself never blocks,
/// a full default queue surfaces the reject
///
/// # See Also
/// - [`TaskQueue`]
/// - [`Dispatcher`]
pub struct QueueManager {
    queues: HashMap<String, Arc<TaskQueue>>,
}

impl QueueManager {
    /// Creates / Constructs a [`QueueManager`] over the given queues. The map must
    /// contain [`DEFAULT_QUEUE`], the engine configuration guarantees it
    pub(crate) fn new(queues: HashMap<String, Arc<TaskQueue>>) -> Self {
        debug_assert!(queues.contains_key(DEFAULT_QUEUE));
        Self { queues }
    }

    /// Every queue, used by the engine to spawn the worker pools
    pub(crate) fn all(&self) -> impl Iterator<Item = &Arc<TaskQueue>> {
        self.queues.values()
    }

    /// Looks a queue up by name
    pub fn get(&self, name: &str) -> Option<&Arc<TaskQueue>> {
        self.queues.get(name)
    }

    /// Resolves the target queue for a task: explicit name, then the recurring queue
    /// when applicable, then the default
    pub(crate) fn resolve(&self, explicit: Option<&str>, recurring: bool) -> &Arc<TaskQueue> {
        if let Some(name) = explicit {
            if let Some(queue) = self.queues.get(name) {
                return queue;
            }
            tracing::warn!(queue = name, "unknown queue name, routing to default");
        }
        if recurring
            && let Some(queue) = self.queues.get(RECURRING_QUEUE)
        {
            return queue;
        }
        self.queues
            .get(DEFAULT_QUEUE)
            .expect("the default queue always exists")
    }

    /// Routes one execution with blocking semantics whatever the queue's overflow
    /// behavior, the recovery path where backpressure must never drop work
    pub(crate) async fn enqueue_blocking(
        &self,
        item: ExecutionItem,
    ) -> Result<String, EverTaskError> {
        let target = self.resolve(item.task.queue_name.as_deref(), item.task.is_recurring());
        match target.queue_wait(item).await {
            EnqueueOutcome::Accepted | EnqueueOutcome::Full(_) => Ok(target.name().to_string()),
            EnqueueOutcome::Closed => Err(EverTaskError::ShuttingDown),
        }
    }

    /// Routes and enqueues one ready execution, returning the name of the queue that
    /// accepted it
    pub(crate) async fn enqueue(&self, item: ExecutionItem) -> Result<String, EverTaskError> {
        let target = self.resolve(item.task.queue_name.as_deref(), item.task.is_recurring());
        let task_id = item.task.id;

        match target.queue(item).await {
            EnqueueOutcome::Accepted => Ok(target.name().to_string()),
            EnqueueOutcome::Closed => Err(EverTaskError::ShuttingDown),
            EnqueueOutcome::Full(item) => {
                if target.full_behavior() == QueueFullBehavior::FallbackToDefault
                    && target.name() != DEFAULT_QUEUE
                {
                    let fallback = self
                        .queues
                        .get(DEFAULT_QUEUE)
                        .expect("the default queue always exists");
                    tracing::debug!(
                        task.id = %task_id,
                        from = target.name(),
                        "queue full, falling back to default"
                    );
                    return match fallback.try_queue(item) {
                        EnqueueOutcome::Accepted => Ok(fallback.name().to_string()),
                        EnqueueOutcome::Closed => Err(EverTaskError::ShuttingDown),
                        EnqueueOutcome::Full(_) => Err(EverTaskError::QueueFull {
                            queue: fallback.name().to_string(),
                            task_id: task_id.to_string(),
                        }),
                    };
                }
                Err(EverTaskError::QueueFull {
                    queue: target.name().to_string(),
                    task_id: task_id.to_string(),
                })
            }
        }
    }
}
