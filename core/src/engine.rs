use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cancellation::{Blacklist, CancellationRegistry};
use crate::clock::{SchedulerClock, SystemClock};
use crate::config::EverTaskConfig;
use crate::dispatcher::{DispatchMode, Dispatcher};
use crate::errors::EverTaskError;
use crate::executor::Executor;
use crate::monitoring::{TaskEventPublisher, TaskEventSubscriber};
use crate::queue::QueueManager;
use crate::recovery;
use crate::registry::HandlerRegistry;
use crate::schedule::RecurringSchedule;
use crate::scheduler::Scheduler;
use crate::storage::{InMemoryTaskStorage, TaskStorage};
use crate::task::{TaskHandler, TaskId, TaskRequest};
use crate::worker::WorkerPool;

/// How long the hard-stop phase waits after the service token fires before in-flight
/// workers are aborted outright
const HARD_STOP_GRACE: Duration = Duration::from_secs(5);

/// [`EverTask`] is the engine façade: it owns the storage handle, the handler registry,
/// the named queues, the scheduler shards, the worker pools and the monitoring
/// publisher, and wires them together at construction time. Ownership is linear, the
/// composites know each other only through the interfaces they were handed and nothing
/// points back
///
/// # Lifecycle
/// 1. Construct with [`EverTask::new`] (bundled in-memory storage) or
///    [`EverTask::with_storage`]
/// 2. Register handlers with [`EverTask::register`] / [`EverTask::register_with`] and
///    subscribers with [`EverTask::subscribe`]
/// 3. [`EverTask::start`] spawns the workers and scheduler loops, then runs the
///    recovery pass over whatever the previous process left unfinished
/// 4. Dispatch through [`EverTask::dispatch`] and friends (dispatching before `start`
///    is fine, the work waits for the workers)
/// 5. [`EverTask::stop`] stops intake, drains in-flight work for the grace period,
///    then cancels what remains
///
/// # Example
/// ```ignore
/// use evertask::engine::EverTask;
/// use evertask::config::EverTaskConfig;
/// use std::time::Duration;
///
/// let engine = EverTask::new(EverTaskConfig::default())?;
/// engine.register::<EchoHandler>();
/// engine.start().await?;
///
/// let id = engine.dispatch(&Echo { message: "hello".into() }).await?;
///
/// engine.stop(Duration::from_secs(30)).await;
/// ```
///
/// # See Also
/// - [`EverTaskConfig`]
/// - [`Dispatcher`]
/// - [`Scheduler`]
/// - [`TaskStorage`]
pub struct EverTask {
    storage: Arc<dyn TaskStorage>,
    registry: Arc<HandlerRegistry>,
    publisher: Arc<TaskEventPublisher>,
    queues: Arc<QueueManager>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn SchedulerClock>,
    executor: Arc<Executor>,
    dispatcher: Arc<Dispatcher>,
    /// Stops consumption: scheduler loops and workers
    loop_token: CancellationToken,
    /// Cancels in-flight handler executions, the parent of every task token
    service_token: CancellationToken,
    runtime: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl EverTask {
    /// Creates / Constructs an engine over the bundled [`InMemoryTaskStorage`]
    pub fn new(config: EverTaskConfig) -> Result<Self, EverTaskError> {
        Self::with_storage(config, Arc::new(InMemoryTaskStorage::new()))
    }

    /// Creates / Constructs an engine over the given storage provider, using the
    /// system clock
    pub fn with_storage(
        config: EverTaskConfig,
        storage: Arc<dyn TaskStorage>,
    ) -> Result<Self, EverTaskError> {
        Self::with_storage_and_clock(config, storage, Arc::new(SystemClock))
    }

    /// Creates / Constructs an engine over the given storage provider and clock. A
    /// virtual clock here makes the whole scheduling pipeline simulatable in tests
    pub fn with_storage_and_clock(
        config: EverTaskConfig,
        storage: Arc<dyn TaskStorage>,
        clock: Arc<dyn SchedulerClock>,
    ) -> Result<Self, EverTaskError> {
        config.validate()?;

        let registry = Arc::new(HandlerRegistry::new());
        let publisher = Arc::new(TaskEventPublisher::new());
        let queues = Arc::new(QueueManager::new(config.build_queues()));
        let scheduler = Arc::new(Scheduler::new(config.scheduler_shards()));
        let cancellations = Arc::new(CancellationRegistry::new());
        let blacklist = Arc::new(Blacklist::new());
        let loop_token = CancellationToken::new();
        let service_token = CancellationToken::new();

        let executor = Arc::new(Executor::new(
            storage.clone(),
            registry.clone(),
            cancellations.clone(),
            blacklist.clone(),
            scheduler.clone(),
            publisher.clone(),
            clock.clone(),
            config.default_retry().clone(),
            config.default_timeout(),
            service_token.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            storage.clone(),
            registry.clone(),
            scheduler.clone(),
            queues.clone(),
            clock.clone(),
            publisher.clone(),
            cancellations,
            blacklist,
            service_token.clone(),
            config.throw_if_unable_to_persist(),
            config.id_generator().clone(),
        ));

        Ok(Self {
            storage,
            registry,
            publisher,
            queues,
            scheduler,
            clock,
            executor,
            dispatcher,
            loop_token,
            service_token,
            runtime: Mutex::new(None),
        })
    }

    /// Registers a [`Default`]-constructible handler
    pub fn register<H: TaskHandler + Default>(&self) {
        self.registry.register::<H>();
    }

    /// Registers a handler through a factory closure
    pub fn register_with<H, F>(&self, factory: F)
    where
        H: TaskHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.registry.register_with(factory);
    }

    /// Subscribes to the lifecycle event fan-out
    pub fn subscribe(&self, subscriber: Arc<dyn TaskEventSubscriber>) {
        self.publisher.subscribe(subscriber);
    }

    /// The storage handle the engine runs over
    pub fn storage(&self) -> &Arc<dyn TaskStorage> {
        &self.storage
    }

    /// The ingress dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Whether [`EverTask::start`] has run and [`EverTask::stop`] has not
    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    /// Starts the engine: spawns the worker pools and the scheduler loops, then runs
    /// the recovery pass over tasks the previous process left unfinished. Starting an
    /// already started engine does nothing
    pub async fn start(&self) -> Result<(), EverTaskError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        let mut handles = Vec::new();
        for queue in self.queues.all() {
            handles.extend(WorkerPool::spawn(
                queue,
                self.executor.clone(),
                self.loop_token.clone(),
            ));
        }
        handles.extend(self.scheduler.spawn_loops(
            self.clock.clone(),
            self.queues.clone(),
            self.storage.clone(),
            self.publisher.clone(),
            self.loop_token.clone(),
        ));
        *runtime = Some(handles);
        drop(runtime);

        tracing::info!(
            shards = self.scheduler.shard_count(),
            "engine started, running recovery"
        );
        recovery::run(&self.storage, &self.dispatcher).await;
        Ok(())
    }

    /// Stops the engine: new dispatches are rejected, the scheduler loops and workers
    /// wind down, in-flight executions get `grace` to finish before their tokens are
    /// cancelled (ending them as cancelled-by-service), and whatever still lingers
    /// afterwards is aborted
    pub async fn stop(&self, grace: Duration) {
        let Some(mut handles) = self.runtime.lock().await.take() else {
            return;
        };
        tracing::info!(?grace, "engine stopping");

        self.dispatcher.stop_accepting();
        self.loop_token.cancel();

        if !drain(&mut handles, grace).await {
            tracing::warn!("shutdown grace expired, cancelling in-flight executions");
            self.service_token.cancel();
            if !drain(&mut handles, HARD_STOP_GRACE).await {
                tracing::error!(stragglers = handles.len(), "aborting unresponsive workers");
                for handle in &handles {
                    handle.abort();
                }
            }
        }
        tracing::info!("engine stopped");
    }

    /// Dispatches a request for immediate execution
    pub async fn dispatch<T: TaskRequest>(&self, request: &T) -> Result<TaskId, EverTaskError> {
        self.dispatcher.dispatch(request).await
    }

    /// Dispatches a request to run after `delay`
    pub async fn dispatch_in<T: TaskRequest>(
        &self,
        request: &T,
        delay: Duration,
    ) -> Result<TaskId, EverTaskError> {
        self.dispatcher.dispatch_in(request, delay).await
    }

    /// Dispatches a request to run at an absolute instant
    pub async fn dispatch_at<T: TaskRequest>(
        &self,
        request: &T,
        at: DateTime<Utc>,
    ) -> Result<TaskId, EverTaskError> {
        self.dispatcher.dispatch_at(request, at).await
    }

    /// Dispatches a request on a recurring schedule
    pub async fn dispatch_recurring<T: TaskRequest>(
        &self,
        request: &T,
        schedule: RecurringSchedule,
    ) -> Result<TaskId, EverTaskError> {
        self.dispatcher.dispatch_recurring(request, schedule).await
    }

    /// The full dispatch operation with an explicit mode and idempotency key
    pub async fn dispatch_with<T: TaskRequest>(
        &self,
        request: &T,
        mode: DispatchMode,
        task_key: Option<String>,
    ) -> Result<TaskId, EverTaskError> {
        self.dispatcher.dispatch_with(request, mode, task_key).await
    }

    /// Cancels a task by id, see [`Dispatcher::cancel`]
    pub async fn cancel(&self, id: TaskId) -> Result<(), EverTaskError> {
        self.dispatcher.cancel(id).await
    }
}

/// Awaits the handles until `limit` elapses, returning whether all of them finished.
/// Unfinished handles stay in the vector for the next phase
async fn drain(handles: &mut Vec<JoinHandle<()>>, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while let Some(mut handle) = handles.pop() {
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(_) => continue,
            Err(_) => {
                handles.push(handle);
                return false;
            }
        }
    }
    true
}
