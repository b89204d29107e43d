use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::SchedulerClock;
use crate::monitoring::{TaskEventPublisher, TaskLifecycleEvent};
use crate::queue::{ExecutionItem, QueueManager};
use crate::storage::TaskStorage;
use crate::task::{FailureDetail, TaskId, TaskStatus};

#[allow(unused_imports)]
use crate::dispatcher::Dispatcher;

/// One time-ordered entry waiting for its instant. Ties on the instant break by
/// insertion order through the per-shard sequence number
struct ScheduledEntry {
    at: DateTime<Utc>,
    seq: u64,
    item: ExecutionItem,
}

impl Eq for ScheduledEntry {}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

/// One independent scheduler shard: its own heap, its own lock, its own wake-up signal.
/// A failure or a slow consumer in one shard never touches the others
pub(crate) struct SchedulerShard {
    index: usize,
    heap: Mutex<BinaryHeap<Reverse<ScheduledEntry>>>,
    notify: Notify,
    wake_pending: AtomicBool,
    seq: AtomicU64,
}

impl SchedulerShard {
    fn new(index: usize) -> Self {
        Self {
            index,
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            wake_pending: AtomicBool::new(false),
            seq: AtomicU64::new(0),
        }
    }

    /// Inserts an entry and atomically signals the loop. Signal deduplication goes
    /// through a single pending-wake bit: when a wake is already pending no second
    /// signal is issued, which keeps the notifier from overflowing under high
    /// concurrency and costs nothing when the loop is idle
    fn insert(&self, item: ExecutionItem, at: DateTime<Utc>) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut heap = self.heap.lock().expect("scheduler heap lock poisoned");
            heap.push(Reverse(ScheduledEntry { at, seq, item }));
        }
        if self
            .wake_pending
            .compare_exchange(
                false,
                true,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_ok()
        {
            self.notify.notify_one();
        }
    }

    /// The instant of the earliest entry, `None` when the shard is empty
    fn peek_next(&self) -> Option<DateTime<Utc>> {
        self.heap
            .lock()
            .expect("scheduler heap lock poisoned")
            .peek()
            .map(|entry| entry.0.at)
    }

    /// Pops every entry due at or before `now`, in non-decreasing time order
    fn pop_due(&self, now: DateTime<Utc>) -> Vec<ExecutionItem> {
        let mut heap = self.heap.lock().expect("scheduler heap lock poisoned");
        let mut due = Vec::new();
        while let Some(earliest) = heap.peek() {
            if earliest.0.at > now {
                break;
            }
            due.push(heap.pop().expect("peeked entry exists").0.item);
        }
        due
    }

    fn len(&self) -> usize {
        self.heap.lock().expect("scheduler heap lock poisoned").len()
    }
}

/// [`Scheduler`] holds not-yet-due tasks in a time-ordered structure and moves them into
/// their execution queue at the right instant, consuming zero CPU while idle.
///
/// # Loop
/// Each shard runs one loop: peek the earliest entry, sleep until its instant on a
/// cancellable timer (or indefinitely when empty), wake early when a new entry arrives
/// through the wake-up signal, then pop everything due and route it through the
/// [`QueueManager`]. Due tasks fire in non-decreasing order of their scheduled instant,
/// ties break by insertion order. There is no ordering across shards.
///
/// # Sharding
/// The shard for a task is `unsigned_hash(task_id) % shard_count`. The hash is a `u64`
/// and therefore never negative, the modulo always lands on a valid shard. One shard is
/// the default and plenty below roughly ten thousand schedules per second, sharding is
/// a throughput knob and not a correctness requirement.
///
/// # Stopping
/// Stopping the scheduler cancels the sleeps and returns, it drains nothing
///
/// # See Also
/// - [`QueueManager`]
/// - [`Dispatcher`]
pub struct Scheduler {
    shards: Vec<Arc<SchedulerShard>>,
}

impl Scheduler {
    /// Creates / Constructs a [`Scheduler`] with the given shard count (clamped to at
    /// least one)
    pub(crate) fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|index| Arc::new(SchedulerShard::new(index)))
            .collect();
        Self { shards }
    }

    /// The number of independent shards
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// The number of entries currently waiting across all shards
    pub fn pending_count(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    /// The shard index a task id lands on
    pub fn shard_for(&self, id: &TaskId) -> usize {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Schedules one ready execution to fire at `at`
    pub(crate) fn schedule(&self, item: ExecutionItem, at: DateTime<Utc>) {
        let shard = &self.shards[self.shard_for(&item.task.id)];
        tracing::trace!(task.id = %item.task.id, %at, shard = shard.index, "scheduled");
        shard.insert(item, at);
    }

    /// Spawns one loop per shard. The loops stop when `shutdown` is cancelled
    pub(crate) fn spawn_loops(
        &self,
        clock: Arc<dyn SchedulerClock>,
        queues: Arc<QueueManager>,
        storage: Arc<dyn TaskStorage>,
        publisher: Arc<TaskEventPublisher>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.shards
            .iter()
            .map(|shard| {
                let shard = shard.clone();
                let clock = clock.clone();
                let queues = queues.clone();
                let storage = storage.clone();
                let publisher = publisher.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_shard_loop(shard, clock, queues, storage, publisher, shutdown).await;
                })
            })
            .collect()
    }
}

async fn run_shard_loop(
    shard: Arc<SchedulerShard>,
    clock: Arc<dyn SchedulerClock>,
    queues: Arc<QueueManager>,
    storage: Arc<dyn TaskStorage>,
    publisher: Arc<TaskEventPublisher>,
    shutdown: CancellationToken,
) {
    tracing::debug!(shard = shard.index, "scheduler shard loop started");
    loop {
        let next = shard.peek_next();
        tokio::select! {
            _ = shutdown.cancelled() => break,

            _ = shard.notify.notified() => {
                shard.wake_pending.store(false, AtomicOrdering::Release);
                continue;
            }

            _ = async {
                match next {
                    Some(at) => clock.idle_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                let now = clock.now().await;
                for item in shard.pop_due(now) {
                    fire_due(&queues, &storage, &publisher, item).await;
                }
            }
        }
    }
    tracing::debug!(shard = shard.index, "scheduler shard loop stopped");
}

/// Routes one due execution into its queue and records the transition. The status write
/// is best-effort: a storage hiccup after a successful channel write is logged and the
/// task still runs
async fn fire_due(
    queues: &QueueManager,
    storage: &Arc<dyn TaskStorage>,
    publisher: &TaskEventPublisher,
    item: ExecutionItem,
) {
    let task_id = item.task.id;
    // The entry may have gone stale while it waited: cancelled, re-keyed or finished
    match storage.get(&task_id).await {
        Ok(Some(row)) if row.status.is_terminal() => {
            tracing::debug!(task.id = %task_id, status = %row.status, "due entry no longer runnable");
            return;
        }
        Ok(Some(row)) if row.scheduled_execution != item.task.scheduled_execution => {
            tracing::debug!(task.id = %task_id, "due entry superseded by a newer dispatch");
            return;
        }
        _ => {}
    }
    // Written ahead of the channel push so a fast worker can never observe the
    // in-progress transition before the queued one lands. Best-effort either way
    if let Err(err) = storage.set_status(&task_id, TaskStatus::Queued, None).await {
        tracing::warn!(task.id = %task_id, %err, "failed to record queued status");
    }
    match queues.enqueue(item).await {
        Ok(queue) => {
            publisher.emit(TaskLifecycleEvent::Queued {
                id: task_id,
                queue,
                at: Utc::now(),
            });
        }
        Err(err) => {
            tracing::error!(task.id = %task_id, %err, "failed to enqueue due task");
            let detail = FailureDetail::from_message(err.to_string());
            if let Err(status_err) = storage
                .set_status(&task_id, TaskStatus::Failed, Some(detail.clone()))
                .await
            {
                tracing::warn!(task.id = %task_id, %status_err, "failed to record failure");
            }
            publisher.emit(TaskLifecycleEvent::Failed {
                id: task_id,
                reason: detail,
                at: Utc::now(),
            });
        }
    }
}
