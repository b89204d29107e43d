use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use typed_builder::TypedBuilder;

use crate::errors::EverTaskError;
use crate::queue::{DEFAULT_QUEUE, QueueFullBehavior, TaskQueue};
use crate::retry::RetryPolicy;
use crate::task::TaskId;

#[allow(unused_imports)]
use crate::engine::EverTask;

#[allow(unused_imports)]
use crate::scheduler::Scheduler;

/// The factory producing task ids, pluggable so hosts with their own id scheme can keep
/// storage ordering intact (the ids should remain time-ordered)
pub type IdGenerator = Arc<dyn Fn() -> TaskId + Send + Sync>;

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// The default worker fan-out per queue: `max(4, 2 x CPU)`
pub fn default_parallelism() -> usize {
    (2 * cpu_count()).max(4)
}

/// The default bounded queue capacity: `max(1000, 200 x CPU)`
pub fn default_channel_capacity() -> usize {
    (200 * cpu_count()).max(1000)
}

/// Per-queue tuning. Every field is optional, unset fields inherit the engine-wide
/// defaults from [`EverTaskConfig`]
///
/// # Example
/// ```ignore
/// use evertask::config::QueueConfig;
/// use evertask::queue::QueueFullBehavior;
///
/// let reports = QueueConfig::builder()
///     .max_parallelism(2)
///     .capacity(64)
///     .full_behavior(QueueFullBehavior::FallbackToDefault)
///     .build();
/// ```
#[derive(Clone, Debug, Default, TypedBuilder)]
pub struct QueueConfig {
    /// Worker fan-out for this queue, engine default when unset
    #[builder(default, setter(strip_option))]
    pub max_parallelism: Option<usize>,

    /// Bounded capacity for this queue, engine default when unset
    #[builder(default, setter(strip_option))]
    pub capacity: Option<usize>,

    /// What producers experience when the queue is full
    #[builder(default)]
    pub full_behavior: QueueFullBehavior,

    /// Per-queue execution timeout, engine default when unset
    #[builder(default, setter(strip_option))]
    pub default_timeout: Option<Duration>,

    /// Per-queue retry policy, engine default when unset
    #[builder(default, setter(strip_option))]
    pub default_retry: Option<RetryPolicy>,
}

/// [`EverTaskConfig`] is the engine-wide configuration surface: the named queue table,
/// the global parallelism and capacity defaults (scaled from the CPU count), the default
/// retry and timeout policies, the persistence failure policy and the scheduler shard
/// opt-in.
///
/// # Constructor(s)
/// Built through [`EverTaskConfig::builder`], every field has a sensible default so
/// `EverTaskConfig::builder().build()` is a working single-queue configuration. Named
/// queues are added through the `queue` builder mutator
///
/// # Example
/// ```ignore
/// use evertask::config::{EverTaskConfig, QueueConfig};
///
/// let config = EverTaskConfig::builder()
///     .queue("reports", QueueConfig::builder().max_parallelism(2).build())
///     .max_degree_of_parallelism(8)
///     .throw_if_unable_to_persist(true)
///     .scheduler_shards(4)
///     .build();
/// ```
///
/// # See Also
/// - [`QueueConfig`]
/// - [`EverTask`]
#[derive(TypedBuilder)]
#[builder(mutators(
    pub fn queue<N: Into<String>>(&mut self, name: N, config: QueueConfig) {
        self.queues.insert(name.into(), config);
    }
))]
pub struct EverTaskConfig {
    /// The named queue table. The `default` queue always exists, configured here or
    /// created implicitly from the engine-wide defaults
    #[builder(via_mutators(init = HashMap::new()))]
    queues: HashMap<String, QueueConfig>,

    /// Default worker fan-out per queue
    ///
    /// # Default Value
    /// `max(4, 2 x CPU)`
    #[builder(default = default_parallelism())]
    max_degree_of_parallelism: usize,

    /// Default bounded capacity per queue
    ///
    /// # Default Value
    /// `max(1000, 200 x CPU)`
    #[builder(default = default_channel_capacity())]
    channel_capacity: usize,

    /// The retry policy used when neither the handler nor the queue overrides it
    ///
    /// # Default Value
    /// Three attempts, half a second apart
    #[builder(default)]
    default_retry: RetryPolicy,

    /// The execution timeout used when neither the handler nor the queue overrides it,
    /// no timeout when unset
    #[builder(default, setter(strip_option))]
    default_timeout: Option<Duration>,

    /// Whether a persistence failure aborts the dispatch (`true`, the default) or the
    /// task continues best-effort in memory only
    #[builder(default = true)]
    throw_if_unable_to_persist: bool,

    /// The number of independent scheduler shards. One is plenty for most hosts,
    /// raising it is worthwhile from roughly ten thousand sustained schedules per
    /// second upward
    #[builder(default = 1)]
    scheduler_shards: usize,

    /// The task id factory
    ///
    /// # Default Value
    /// Time-ordered UUID v7 generation
    #[builder(
        default = Arc::new(TaskId::generate) as IdGenerator,
        setter(transform = |f: impl Fn() -> TaskId + Send + Sync + 'static| Arc::new(f) as IdGenerator),
    )]
    id_generator: IdGenerator,
}

impl Default for EverTaskConfig {
    fn default() -> Self {
        EverTaskConfig::builder().build()
    }
}

impl EverTaskConfig {
    /// The engine-wide default worker fan-out
    pub fn max_degree_of_parallelism(&self) -> usize {
        self.max_degree_of_parallelism
    }

    /// The engine-wide default queue capacity
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    /// The engine-wide default retry policy
    pub fn default_retry(&self) -> &RetryPolicy {
        &self.default_retry
    }

    /// The engine-wide default execution timeout
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Whether persistence failures abort the dispatch
    pub fn throw_if_unable_to_persist(&self) -> bool {
        self.throw_if_unable_to_persist
    }

    /// The configured scheduler shard count
    pub fn scheduler_shards(&self) -> usize {
        self.scheduler_shards.max(1)
    }

    /// The task id factory
    pub fn id_generator(&self) -> &IdGenerator {
        &self.id_generator
    }

    /// Validates the configuration, failing on unusable values and logging warnings
    /// for values that work but deserve a second look
    pub fn validate(&self) -> Result<(), EverTaskError> {
        if self.channel_capacity == 0 {
            return Err(EverTaskError::Configuration(
                "channel capacity must be at least 1".into(),
            ));
        }
        if self.max_degree_of_parallelism == 0 {
            return Err(EverTaskError::Configuration(
                "max degree of parallelism must be at least 1".into(),
            ));
        }
        for (name, queue) in &self.queues {
            if queue.capacity == Some(0) {
                return Err(EverTaskError::Configuration(format!(
                    "queue `{name}` has zero capacity"
                )));
            }
            if queue.max_parallelism == Some(0) {
                return Err(EverTaskError::Configuration(format!(
                    "queue `{name}` has zero parallelism"
                )));
            }
            let capacity = queue.capacity.unwrap_or(self.channel_capacity);
            let parallelism = queue.max_parallelism.unwrap_or(self.max_degree_of_parallelism);
            if capacity < parallelism {
                tracing::warn!(
                    queue = name.as_str(),
                    capacity,
                    parallelism,
                    "queue capacity is below its worker count, workers will starve"
                );
            }
        }
        if self.max_degree_of_parallelism > 8 * cpu_count() {
            tracing::warn!(
                parallelism = self.max_degree_of_parallelism,
                cpus = cpu_count(),
                "worker fan-out far exceeds the CPU count, consider lowering it"
            );
        }
        if self.scheduler_shards == 0 {
            tracing::warn!("scheduler shard count of zero is clamped to one");
        }
        Ok(())
    }

    /// Materializes the queue table, always including the `default` queue
    pub(crate) fn build_queues(&self) -> HashMap<String, Arc<TaskQueue>> {
        let mut queues: HashMap<String, Arc<TaskQueue>> = HashMap::new();
        for (name, config) in &self.queues {
            queues.insert(
                name.clone(),
                Arc::new(TaskQueue::new(
                    name.clone(),
                    config.capacity.unwrap_or(self.channel_capacity),
                    config.full_behavior,
                    config
                        .max_parallelism
                        .unwrap_or(self.max_degree_of_parallelism),
                    config.default_timeout,
                    config.default_retry.clone(),
                )),
            );
        }
        queues.entry(DEFAULT_QUEUE.to_string()).or_insert_with(|| {
            Arc::new(TaskQueue::new(
                DEFAULT_QUEUE,
                self.channel_capacity,
                QueueFullBehavior::default(),
                self.max_degree_of_parallelism,
                None,
                None,
            ))
        });
        queues
    }
}
