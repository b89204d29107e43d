use chrono::{DateTime, Duration as TimeDelta, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cancellation::{Blacklist, CancellationRegistry};
use crate::clock::SchedulerClock;
use crate::config::IdGenerator;
use crate::errors::EverTaskError;
use crate::monitoring::{TaskEventPublisher, TaskLifecycleEvent};
use crate::queue::{ExecutionItem, QueueManager};
use crate::registry::HandlerRegistry;
use crate::schedule::RecurringSchedule;
use crate::scheduler::Scheduler;
use crate::storage::TaskStorage;
use crate::task::{
    AuditLevel, CancelReason, FailureDetail, PersistedTask, TaskId, TaskRequest, TaskStatus,
};

#[allow(unused_imports)]
use crate::engine::EverTask;

/// Below this time-to-first-run the handler constructed for dispatch validation is kept
/// and reused at execution
const EAGER_DELAY_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Recurring series with occurrences closer together than this keep their handler alive
/// between runs
const EAGER_RECURRING_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Runs scheduled at most this far in the past are fired as-is instead of being skipped
const REDISPATCH_TOLERANCE_MS: i64 = 1_000;

/// When a dispatched task should run
#[derive(Debug, Clone)]
pub enum DispatchMode {
    /// As soon as a worker picks it up
    Immediate,
    /// After the given delay from the dispatch instant
    Delay(Duration),
    /// At an absolute instant
    RunAt(DateTime<Utc>),
    /// On a recurring series
    Recurring(RecurringSchedule),
}

/// [`Dispatcher`] is the public ingress of the engine. It validates that a handler is
/// registered, serializes the request, applies the task-key dedup rules, computes the
/// first run instant, persists the task and routes it either straight into a queue
/// (immediate work) or into the [`Scheduler`] (delayed and recurring work).
///
/// # Ordering Guarantee(s)
/// Persistence always comes first: a task is on its way to execution only after its row
/// exists (or, when the persistence policy tolerates storage failures, after the failure
/// has been logged). A dispatch whose queue rejects it leaves a `Failed` row behind
/// rather than a phantom
///
/// # Dedup Rule(s)
/// A dispatch carrying a `task_key` consults storage first:
/// - an `InProgress` row with that key wins, the dispatch is ignored and its id returned
/// - a `Pending`/`Queued` row is updated in place (scheduling fields only, the run
///   counter survives), its id is returned
/// - a terminal row is replaced by a fresh row under the same key
/// - otherwise a fresh row is inserted
///
/// # See Also
/// - [`EverTask`]
/// - [`Scheduler`]
/// - [`QueueManager`]
pub struct Dispatcher {
    storage: Arc<dyn TaskStorage>,
    registry: Arc<HandlerRegistry>,
    scheduler: Arc<Scheduler>,
    queues: Arc<QueueManager>,
    clock: Arc<dyn SchedulerClock>,
    publisher: Arc<TaskEventPublisher>,
    cancellations: Arc<CancellationRegistry>,
    blacklist: Arc<Blacklist>,
    service_token: CancellationToken,
    throw_if_unable_to_persist: bool,
    id_generator: IdGenerator,
    accepting: AtomicBool,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn TaskStorage>,
        registry: Arc<HandlerRegistry>,
        scheduler: Arc<Scheduler>,
        queues: Arc<QueueManager>,
        clock: Arc<dyn SchedulerClock>,
        publisher: Arc<TaskEventPublisher>,
        cancellations: Arc<CancellationRegistry>,
        blacklist: Arc<Blacklist>,
        service_token: CancellationToken,
        throw_if_unable_to_persist: bool,
        id_generator: IdGenerator,
    ) -> Self {
        Self {
            storage,
            registry,
            scheduler,
            queues,
            clock,
            publisher,
            cancellations,
            blacklist,
            service_token,
            throw_if_unable_to_persist,
            id_generator,
            accepting: AtomicBool::new(true),
        }
    }

    /// Stops accepting new dispatches, part of the shutdown sequence
    pub(crate) fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Dispatches a request for immediate execution
    pub async fn dispatch<T: TaskRequest>(&self, request: &T) -> Result<TaskId, EverTaskError> {
        self.dispatch_with(request, DispatchMode::Immediate, None)
            .await
    }

    /// Dispatches a request to run after `delay`
    pub async fn dispatch_in<T: TaskRequest>(
        &self,
        request: &T,
        delay: Duration,
    ) -> Result<TaskId, EverTaskError> {
        self.dispatch_with(request, DispatchMode::Delay(delay), None)
            .await
    }

    /// Dispatches a request to run at an absolute instant
    pub async fn dispatch_at<T: TaskRequest>(
        &self,
        request: &T,
        at: DateTime<Utc>,
    ) -> Result<TaskId, EverTaskError> {
        self.dispatch_with(request, DispatchMode::RunAt(at), None)
            .await
    }

    /// Dispatches a request on a recurring schedule
    pub async fn dispatch_recurring<T: TaskRequest>(
        &self,
        request: &T,
        schedule: RecurringSchedule,
    ) -> Result<TaskId, EverTaskError> {
        self.dispatch_with(request, DispatchMode::Recurring(schedule), None)
            .await
    }

    /// The full dispatch operation: mode and optional idempotency key.
    ///
    /// Dispatching the same non-null `task_key` repeatedly while the prior row is live
    /// resolves to one logical task whose scheduling fields reflect the last dispatch
    pub async fn dispatch_with<T: TaskRequest>(
        &self,
        request: &T,
        mode: DispatchMode,
        task_key: Option<String>,
    ) -> Result<TaskId, EverTaskError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EverTaskError::ShuttingDown);
        }

        let request_type = T::request_type();
        let Some(entry) = self.registry.get(request_type) else {
            return Err(EverTaskError::NoHandlerRegistered(request_type.to_string()));
        };

        let payload = serde_json::to_string(request).map_err(|err| {
            EverTaskError::SerializationFailed(request_type.to_string(), err.to_string())
        })?;

        let now = self.clock.now().await;
        let (scheduled_execution, recurring) = self.first_schedule(&mode, now)?;

        // Constructed for validation either way, kept only when execution is near
        let handler = entry.construct();
        let queue_name = handler.queue_name();
        let eager = self.is_eager(scheduled_execution, recurring.as_ref(), now);

        // Task-key dedup against the existing row
        if let Some(key) = &task_key
            && let Some(existing) = self
                .storage
                .get_by_task_key(key)
                .await
                .map_err(|err| EverTaskError::from_storage(key.clone(), err))?
        {
            match existing.status {
                TaskStatus::InProgress => {
                    tracing::debug!(task.id = %existing.id, %key, "dispatch ignored, task in progress");
                    return Ok(existing.id);
                }
                TaskStatus::Pending | TaskStatus::Queued => {
                    let mut updated = existing.clone();
                    updated.request_type = request_type.to_string();
                    updated.request_payload = payload;
                    updated.handler_type = entry.handler_type.to_string();
                    updated.queue_name = queue_name;
                    updated.scheduled_execution = scheduled_execution;
                    updated.next_run = recurring.as_ref().and(scheduled_execution);
                    updated.recurring = recurring;
                    self.storage
                        .update_task(&updated)
                        .await
                        .map_err(|err| EverTaskError::from_storage(updated.id, err))?;
                    tracing::debug!(task.id = %updated.id, %key, "dispatch updated live task in place");
                    let item = ExecutionItem {
                        task: updated.clone(),
                        handler: eager.then_some(handler),
                    };
                    self.route(item, scheduled_execution).await?;
                    return Ok(updated.id);
                }
                // Terminal rows are replaced below through the normal insert path
                _ => {}
            }
        }

        let id = (self.id_generator)();
        let task = PersistedTask {
            id,
            task_key,
            request_type: request_type.to_string(),
            request_payload: payload,
            handler_type: entry.handler_type.to_string(),
            queue_name,
            status: TaskStatus::Pending,
            created_at: now,
            scheduled_execution,
            next_run: recurring.as_ref().and(scheduled_execution),
            recurring,
            current_run_count: 0,
            audit_level: AuditLevel::default(),
        };

        if let Err(err) = self.storage.persist(task.clone()).await {
            if self.throw_if_unable_to_persist {
                return Err(EverTaskError::from_storage(id, err));
            }
            tracing::warn!(task.id = %id, %err, "persistence failed, continuing in memory only");
        }

        self.publisher.emit(TaskLifecycleEvent::Dispatched {
            id,
            request_type: task.request_type.clone(),
            at: Utc::now(),
        });

        let item = ExecutionItem {
            task,
            handler: eager.then_some(handler),
        };
        self.route(item, scheduled_execution).await?;
        Ok(id)
    }

    /// Cancels a task. A task not yet in progress is blacklisted (the worker skips it
    /// at dequeue) and moved to `CancelledByUser`, a task already in progress has its
    /// cancellation token signalled and whether it stops is its handler's contract
    pub async fn cancel(&self, id: TaskId) -> Result<(), EverTaskError> {
        // Signal whichever side holds (or will hold) the handle
        self.cancellations
            .obtain(id, &self.service_token)
            .cancel();

        let row = self
            .storage
            .get(&id)
            .await
            .map_err(|err| EverTaskError::from_storage(id, err))?
            .ok_or_else(|| EverTaskError::TaskNotFound(id.to_string()))?;

        match row.status {
            TaskStatus::Pending | TaskStatus::Queued => {
                self.blacklist.insert(id);
                self.storage
                    .set_status(&id, TaskStatus::CancelledByUser, None)
                    .await
                    .map_err(|err| EverTaskError::from_storage(id, err))?;
                self.publisher.emit(TaskLifecycleEvent::Cancelled {
                    id,
                    reason: CancelReason::User,
                    at: Utc::now(),
                });
            }
            TaskStatus::InProgress => {
                // The executor owns the handle and removes it when the run ends
                tracing::debug!(task.id = %id, "cancellation signalled to in-progress task");
            }
            terminal => {
                tracing::debug!(task.id = %id, status = %terminal, "cancel on finished task ignored");
            }
        }
        if row.status != TaskStatus::InProgress {
            self.cancellations.remove(&id);
        }
        Ok(())
    }

    /// Re-enters a persisted task into the pipeline under its original id, the recovery
    /// path after a restart. Unresolvable records (handler gone, payload or schedule
    /// unreadable) are marked `Failed` with a structured reason, never propagated
    pub(crate) async fn redispatch(&self, task: PersistedTask) -> Result<(), EverTaskError> {
        let now = self.clock.now().await;

        if !self.registry.contains(&task.request_type) {
            return self
                .fail_unrecoverable(
                    &task,
                    format!("no handler registered for `{}`", task.request_type),
                )
                .await;
        }
        if let Err(err) = serde_json::from_str::<serde_json::Value>(&task.request_payload) {
            return self
                .fail_unrecoverable(&task, format!("request payload unreadable: {err}"))
                .await;
        }
        if let Some(schedule) = &task.recurring
            && let Err(err) = schedule.validate()
        {
            return self
                .fail_unrecoverable(&task, format!("recurring schedule invalid: {err}"))
                .await;
        }

        let mut task = task;
        if task.status != TaskStatus::Pending {
            // A Queued or InProgress record means the previous instance stopped
            // mid-flight, the task resumes from Pending
            if let Err(err) = self
                .storage
                .set_status(&task.id, TaskStatus::Pending, None)
                .await
            {
                tracing::warn!(task.id = %task.id, %err, "failed to reset recovered task");
            }
            task.status = TaskStatus::Pending;
        }

        match &task.recurring {
            None => {
                let at = task.scheduled_execution;
                let item = ExecutionItem {
                    task,
                    handler: None,
                };
                self.route_recovered(item, at).await
            }
            Some(schedule) => {
                let schedule = schedule.clone();
                let anchor = task.scheduled_execution.or(task.next_run);
                self.redispatch_recurring(task, &schedule, anchor, now).await
            }
        }
    }

    /// Recovery routing for a recurring record: resume on rhythm, skipping occurrences
    /// that fell into the past while the service was down
    async fn redispatch_recurring(
        &self,
        mut task: PersistedTask,
        schedule: &RecurringSchedule,
        anchor: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), EverTaskError> {
        let tolerance = TimeDelta::milliseconds(REDISPATCH_TOLERANCE_MS);

        let next = match anchor {
            // Still in the future (or barely past), fire as scheduled
            Some(at) if at >= now - tolerance => Some(at),
            Some(missed) => {
                let occurrence = schedule.next_valid_run(missed, task.current_run_count, now)?;

                // The anchor occurrence itself was never executed, it counts as skipped
                let mut skipped = vec![missed];
                skipped.extend(occurrence.skipped.iter().copied());
                let skipped_count = occurrence.skipped_count + 1;

                if self.storage.supports_skip_records()
                    && let Err(err) = self
                        .storage
                        .record_skipped_occurrences(&task.id, &skipped)
                        .await
                {
                    tracing::warn!(task.id = %task.id, %err, "failed to record skipped occurrences");
                }
                self.publisher.emit(TaskLifecycleEvent::OccurrencesSkipped {
                    id: task.id,
                    count: skipped_count,
                    at: Utc::now(),
                });
                occurrence.next
            }
            None => schedule.first_run(now)?,
        };

        match next {
            Some(at) => {
                task.scheduled_execution = Some(at);
                task.next_run = Some(at);
                if let Err(err) = self.storage.update_task(&task).await {
                    tracing::warn!(task.id = %task.id, %err, "failed to store recovered schedule");
                }
                let item = ExecutionItem {
                    task,
                    handler: None,
                };
                self.route_recovered(item, Some(at)).await
            }
            None => {
                // The series ran out while the service was down
                self.storage
                    .set_status(&task.id, TaskStatus::Completed, None)
                    .await
                    .map_err(|err| EverTaskError::from_storage(task.id, err))?;
                Ok(())
            }
        }
    }

    async fn fail_unrecoverable(
        &self,
        task: &PersistedTask,
        reason: String,
    ) -> Result<(), EverTaskError> {
        tracing::error!(task.id = %task.id, %reason, "recovered task is unrecoverable");
        let detail = FailureDetail::from_message(reason);
        self.storage
            .set_status(&task.id, TaskStatus::Failed, Some(detail.clone()))
            .await
            .map_err(|err| EverTaskError::from_storage(task.id, err))?;
        self.publisher.emit(TaskLifecycleEvent::Failed {
            id: task.id,
            reason: detail,
            at: Utc::now(),
        });
        Ok(())
    }

    /// The first run instant and the embedded schedule for a dispatch mode
    fn first_schedule(
        &self,
        mode: &DispatchMode,
        now: DateTime<Utc>,
    ) -> Result<(Option<DateTime<Utc>>, Option<RecurringSchedule>), EverTaskError> {
        match mode {
            DispatchMode::Immediate => Ok((None, None)),
            DispatchMode::Delay(delay) => {
                let delay = TimeDelta::from_std(*delay).map_err(|err| {
                    EverTaskError::Configuration(format!("dispatch delay out of range: {err}"))
                })?;
                Ok((Some(now + delay), None))
            }
            DispatchMode::RunAt(at) => Ok((Some(*at), None)),
            DispatchMode::Recurring(schedule) => {
                schedule.validate()?;
                match schedule.first_run(now)? {
                    Some(first) => Ok((Some(first), Some(schedule.clone()))),
                    None => Err(EverTaskError::InvalidSchedule(
                        "the schedule produces no occurrences".into(),
                    )),
                }
            }
        }
    }

    /// Whether the handler constructed at dispatch should be kept for execution.
    /// Near-term work (and tight recurring series) keeps it, far-out work reconstructs
    /// a fresh instance at execution to keep idle memory down. Purely an optimization,
    /// observable behavior is identical either way
    fn is_eager(
        &self,
        scheduled_execution: Option<DateTime<Utc>>,
        recurring: Option<&RecurringSchedule>,
        now: DateTime<Utc>,
    ) -> bool {
        if let Some(schedule) = recurring {
            return schedule
                .minimum_interval(now)
                .and_then(|gap| gap.to_std().ok())
                .is_some_and(|gap| gap < EAGER_RECURRING_THRESHOLD);
        }
        match scheduled_execution {
            None => true,
            Some(at) => (at - now)
                .to_std()
                .map(|delay| delay < EAGER_DELAY_THRESHOLD)
                .unwrap_or(true),
        }
    }

    /// Recovery routing: due (or overdue) work enqueues with blocking semantics so a
    /// full queue backpressures the pass instead of failing recovered tasks, timed
    /// work goes into the scheduler as usual
    async fn route_recovered(
        &self,
        item: ExecutionItem,
        scheduled_execution: Option<DateTime<Utc>>,
    ) -> Result<(), EverTaskError> {
        let now = self.clock.now().await;
        match scheduled_execution {
            Some(at) if at > now => {
                self.scheduler.schedule(item, at);
                Ok(())
            }
            _ => {
                let task_id = item.task.id;
                if let Err(err) = self
                    .storage
                    .set_status(&task_id, TaskStatus::Queued, None)
                    .await
                {
                    tracing::warn!(task.id = %task_id, %err, "failed to record queued status");
                }
                let queue = self.queues.enqueue_blocking(item).await?;
                self.publisher.emit(TaskLifecycleEvent::Queued {
                    id: task_id,
                    queue,
                    at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    /// Persist-then-route: immediate work goes straight into a queue, timed work into
    /// the scheduler
    async fn route(
        &self,
        item: ExecutionItem,
        scheduled_execution: Option<DateTime<Utc>>,
    ) -> Result<(), EverTaskError> {
        match scheduled_execution {
            None => {
                let task_id = item.task.id;
                // Written ahead of the channel push so a fast worker can never
                // observe the in-progress transition before the queued one lands.
                // Best-effort either way, a storage hiccup does not unqueue
                if let Err(err) = self
                    .storage
                    .set_status(&task_id, TaskStatus::Queued, None)
                    .await
                {
                    tracing::warn!(task.id = %task_id, %err, "failed to record queued status");
                }
                match self.queues.enqueue(item).await {
                    Ok(queue) => {
                        self.publisher.emit(TaskLifecycleEvent::Queued {
                            id: task_id,
                            queue,
                            at: Utc::now(),
                        });
                        Ok(())
                    }
                    Err(err) => {
                        let detail = FailureDetail::from_message(err.to_string());
                        if let Err(status_err) = self
                            .storage
                            .set_status(&task_id, TaskStatus::Failed, Some(detail))
                            .await
                        {
                            tracing::warn!(task.id = %task_id, %status_err, "failed to record failure");
                        }
                        Err(err)
                    }
                }
            }
            Some(at) => {
                self.scheduler.schedule(item, at);
                Ok(())
            }
        }
    }
}
