use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::executor::{Executor, QueueDefaults};
use crate::queue::TaskQueue;

#[allow(unused_imports)]
use crate::engine::EverTask;

/// [`WorkerPool`] spawns the fixed fan-out of long-lived consumers for one queue.
///
/// Every worker loops on the queue's shared receiving end (the channel hands each item
/// to exactly one of them), executes it to its terminal state and pulls the next. There
/// is no task-per-item spawning in steady state, the workers *are* the concurrency
/// limit. Workers exit only when the shutdown token fires, finishing the item they hold
///
/// # See Also
/// - [`TaskQueue`]
/// - [`EverTask`]
pub(crate) struct WorkerPool;

impl WorkerPool {
    /// Spawns `queue.parallelism()` consumers for the queue, returning their handles
    /// for the shutdown drain
    pub(crate) fn spawn(
        queue: &Arc<TaskQueue>,
        executor: Arc<Executor>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let defaults = QueueDefaults {
            retry: queue.default_retry().cloned(),
            timeout: queue.default_timeout(),
        };

        (0..queue.parallelism())
            .map(|worker| {
                let receiver = queue.receiver();
                let executor = executor.clone();
                let shutdown = shutdown.clone();
                let defaults = defaults.clone();
                let queue_name = queue.name().to_string();
                tokio::spawn(async move {
                    tracing::debug!(queue = queue_name.as_str(), worker, "worker started");
                    loop {
                        let item = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            item = async { receiver.lock().await.recv().await } => {
                                match item {
                                    Some(item) => item,
                                    // Channel closed, nothing will ever arrive again
                                    None => break,
                                }
                            }
                        };
                        executor.execute(item, &defaults).await;
                    }
                    tracing::debug!(queue = queue_name.as_str(), worker, "worker stopped");
                })
            })
            .collect()
    }
}
