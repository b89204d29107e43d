use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cancellation::{Blacklist, CancellationRegistry};
use crate::clock::SchedulerClock;
use crate::monitoring::{TaskEventPublisher, TaskLifecycleEvent};
use crate::queue::ExecutionItem;
use crate::registry::{ErasedTaskHandler, HandlerRegistry, InvokeError};
use crate::retry::{AttemptResult, RetryPolicy, RetryVerdict};
use crate::scheduler::Scheduler;
use crate::storage::TaskStorage;
use crate::task::{
    CancelReason, ExecutionContext, ExecutionFailure, FailureDetail, PersistedTask, TaskStatus,
};

#[allow(unused_imports)]
use crate::queue::TaskQueue;

#[allow(unused_imports)]
use crate::worker::WorkerPool;

/// Recurring series with occurrences closer together than this keep the handler
/// instance alive across runs instead of reconstructing it
const KEEP_HANDLER_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// The per-queue fallback policies a worker hands to the executor, resolved between the
/// handler-level overrides and the engine-wide defaults
#[derive(Clone)]
pub(crate) struct QueueDefaults {
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
}

/// The handler-level overrides, cached once per handler type so repeated executions of
/// the same handler never re-query them
#[derive(Clone)]
struct HandlerOverrides {
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

/// [`Executor`] runs one dequeued task to its terminal state: blacklist check, the
/// storage-protected transition to `InProgress`, policy resolution, the retry loop with
/// timeout and composed cancellation, lifecycle callbacks, terminal status persistence
/// and (for recurring tasks) the drift-corrected reschedule.
///
/// # Cancellation Composition
/// Three sources compose into the token a handler observes: service shutdown (the
/// parent), user cancellation (the per-task child in the registry) and the per-attempt
/// timeout (a race in the attempt loop, not a token). On a timeout trip with the outer
/// token untouched the run classifies as timed out, otherwise as cancelled, and the
/// cancel reason distinguishes shutdown from a user cancel by inspecting the service
/// token.
///
/// # Reschedule Anchor
/// The anchor for a recurring task's next run is the task's own scheduled instant as
/// captured when the item was dequeued, never the post-execution wall clock, and exactly
/// one interval is added per completed run. Occurrences skipped because the run finished
/// late are recorded through the storage capability when the provider supports it
///
/// # See Also
/// - [`WorkerPool`]
/// - [`RetryPolicy`]
/// - [`Scheduler`]
pub(crate) struct Executor {
    storage: Arc<dyn TaskStorage>,
    registry: Arc<HandlerRegistry>,
    cancellations: Arc<CancellationRegistry>,
    blacklist: Arc<Blacklist>,
    scheduler: Arc<Scheduler>,
    publisher: Arc<TaskEventPublisher>,
    clock: Arc<dyn SchedulerClock>,
    default_retry: RetryPolicy,
    default_timeout: Option<Duration>,
    overrides_cache: DashMap<String, HandlerOverrides>,
    service_token: CancellationToken,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        storage: Arc<dyn TaskStorage>,
        registry: Arc<HandlerRegistry>,
        cancellations: Arc<CancellationRegistry>,
        blacklist: Arc<Blacklist>,
        scheduler: Arc<Scheduler>,
        publisher: Arc<TaskEventPublisher>,
        clock: Arc<dyn SchedulerClock>,
        default_retry: RetryPolicy,
        default_timeout: Option<Duration>,
        service_token: CancellationToken,
    ) -> Self {
        Self {
            storage,
            registry,
            cancellations,
            blacklist,
            scheduler,
            publisher,
            clock,
            default_retry,
            default_timeout,
            overrides_cache: DashMap::new(),
            service_token,
        }
    }

    /// Runs one dequeued item to completion. Never panics outward and never returns an
    /// error: every failure path lands in storage, the callbacks and the monitoring
    /// fan-out
    #[tracing::instrument(skip_all, fields(task.id = %item.task.id, request = %item.task.request_type))]
    pub(crate) async fn execute(&self, item: ExecutionItem, queue_defaults: &QueueDefaults) {
        let id = item.task.id;

        if self.blacklist.take(&id) {
            tracing::info!("skipping blacklisted task at dequeue");
            self.cancellations.remove(&id);
            return;
        }

        // Re-read the row and treat it as authoritative: the channel snapshot may be
        // stale (the task was re-dispatched under an idempotency key with a newer
        // payload or scheduling fields) and the Pending/Queued to InProgress
        // transition must go through storage
        let mut persisted = true;
        let task = match self.storage.get(&id).await {
            Ok(Some(row)) => {
                if row.scheduled_execution != item.task.scheduled_execution {
                    tracing::debug!("dropping stale queue entry");
                    return;
                }
                match self.storage.try_set_in_progress(&id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(status = %row.status, "task no longer runnable");
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "storage unavailable marking in-progress, running anyway");
                    }
                }
                row
            }
            Ok(None) => {
                // Dispatched with best-effort persistence, there is no row to guard with
                persisted = false;
                item.task
            }
            Err(err) => {
                tracing::warn!(%err, "storage unavailable before execution, running anyway");
                item.task
            }
        };
        let handler = match item.handler {
            Some(handler) => handler,
            None => match self.registry.get(&task.request_type) {
                Some(entry) => entry.construct(),
                None => {
                    let detail = FailureDetail::from_message(format!(
                        "no handler registered for `{}`",
                        task.request_type
                    ));
                    self.finish_status(&task, TaskStatus::Failed, Some(detail.clone()), persisted)
                        .await;
                    self.publisher.emit(TaskLifecycleEvent::Failed {
                        id,
                        reason: detail,
                        at: Utc::now(),
                    });
                    return;
                }
            },
        };

        let token = self.cancellations.obtain(id, &self.service_token);
        let ctx = ExecutionContext::new(
            id,
            task.current_run_count,
            task.scheduled_execution,
            token.clone(),
        );

        self.publisher.emit(TaskLifecycleEvent::Started {
            id,
            at: Utc::now(),
        });
        handler.started(&ctx).await;

        let (retry, timeout) = self.resolve_policies(&task.handler_type, &handler, queue_defaults);

        let retry_handler = handler.clone();
        let retry_ctx = ctx.clone();
        let retry_publisher = self.publisher.clone();
        let verdict = retry
            .execute(
                |_attempt| self.attempt(&handler, &task.request_payload, &ctx, timeout, &token),
                |attempt, error, delay| {
                    let handler = retry_handler.clone();
                    let ctx = retry_ctx.clone();
                    let publisher = retry_publisher.clone();
                    async move {
                        tracing::debug!(attempt, %error, ?delay, "attempt failed, retrying");
                        publisher.emit(TaskLifecycleEvent::Retried {
                            id,
                            attempt,
                            error: error.to_string(),
                            delay,
                            at: Utc::now(),
                        });
                        handler.retried(&ctx, attempt, &error, delay).await;
                        error
                    }
                },
                &token,
                || self.cancel_reason(),
            )
            .await;

        self.finish(task, handler, ctx, verdict, timeout, persisted)
            .await;

        // The handle must not outlive the run, whatever path ended it
        self.cancellations.remove(&id);
    }

    /// One attempt: the handler invocation raced against the composed token and the
    /// resolved timeout
    async fn attempt(
        &self,
        handler: &Arc<dyn ErasedTaskHandler>,
        payload: &str,
        ctx: &ExecutionContext,
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> AttemptResult {
        let work = handler.invoke(payload, ctx.clone());
        let outcome = match timeout {
            Some(limit) => {
                tokio::select! {
                    result = work => Some(result),
                    _ = token.cancelled() => None,
                    _ = tokio::time::sleep(limit) => {
                        // A trip with the outer token already cancelled is a
                        // cancellation, not a timeout
                        return if token.is_cancelled() {
                            AttemptResult::Cancelled(self.cancel_reason())
                        } else {
                            AttemptResult::TimedOut
                        };
                    }
                }
            }
            None => {
                tokio::select! {
                    result = work => Some(result),
                    _ = token.cancelled() => None,
                }
            }
        };

        match outcome {
            None => AttemptResult::Cancelled(self.cancel_reason()),
            Some(Ok(())) => AttemptResult::Ok,
            Some(Err(InvokeError::Handler(error))) => AttemptResult::Err(error),
            Some(Err(InvokeError::Deserialization(err))) => AttemptResult::Fatal(
                FailureDetail::from_message(format!("request payload unreadable: {err}")),
            ),
        }
    }

    fn cancel_reason(&self) -> CancelReason {
        if self.service_token.is_cancelled() {
            CancelReason::Service
        } else {
            CancelReason::User
        }
    }

    /// Handler-level overrides (cached per handler type) folded with the queue and
    /// engine defaults
    fn resolve_policies(
        &self,
        handler_type: &str,
        handler: &Arc<dyn ErasedTaskHandler>,
        queue_defaults: &QueueDefaults,
    ) -> (RetryPolicy, Option<Duration>) {
        let overrides = self
            .overrides_cache
            .entry(handler_type.to_string())
            .or_insert_with(|| HandlerOverrides {
                retry: handler.retry_policy(),
                timeout: handler.timeout(),
            })
            .clone();

        let retry = overrides
            .retry
            .or_else(|| queue_defaults.retry.clone())
            .unwrap_or_else(|| self.default_retry.clone());
        let timeout = overrides
            .timeout
            .or(queue_defaults.timeout)
            .or(self.default_timeout);
        (retry, timeout)
    }

    /// Terminal handling per verdict: callbacks, status, monitoring, reschedule
    async fn finish(
        &self,
        task: PersistedTask,
        handler: Arc<dyn ErasedTaskHandler>,
        ctx: ExecutionContext,
        verdict: RetryVerdict,
        timeout: Option<Duration>,
        persisted: bool,
    ) {
        let id = task.id;
        match verdict {
            RetryVerdict::Completed { attempts } => {
                tracing::debug!(attempts, "task completed");
                handler.completed(&ctx).await;
                self.finish_status(&task, TaskStatus::Completed, None, persisted)
                    .await;
                self.publisher.emit(TaskLifecycleEvent::Completed {
                    id,
                    at: Utc::now(),
                });
                if task.is_recurring() {
                    self.reschedule_recurring(task, handler, persisted).await;
                }
            }
            RetryVerdict::Failed { error, attempts } => {
                tracing::warn!(attempts, %error, "task failed, retries exhausted");
                let detail = FailureDetail::from_error(&error);
                let failure = ExecutionFailure::Error(detail.clone());
                handler.errored(&ctx, &failure).await;
                self.finish_status(&task, TaskStatus::Failed, Some(detail.clone()), persisted)
                    .await;
                self.publisher.emit(TaskLifecycleEvent::Failed {
                    id,
                    reason: detail,
                    at: Utc::now(),
                });
            }
            RetryVerdict::Fatal(detail) => {
                tracing::error!(reason = %detail, "task failed permanently");
                let failure = ExecutionFailure::Error(detail.clone());
                handler.errored(&ctx, &failure).await;
                self.finish_status(&task, TaskStatus::Failed, Some(detail.clone()), persisted)
                    .await;
                self.publisher.emit(TaskLifecycleEvent::Failed {
                    id,
                    reason: detail,
                    at: Utc::now(),
                });
            }
            RetryVerdict::TimedOut { attempts } => {
                let after = timeout.unwrap_or_default();
                tracing::warn!(attempts, ?after, "task timed out");
                let failure = ExecutionFailure::TimedOut { after };
                handler.errored(&ctx, &failure).await;
                let detail = failure.detail();
                self.finish_status(&task, TaskStatus::Failed, Some(detail.clone()), persisted)
                    .await;
                self.publisher.emit(TaskLifecycleEvent::Failed {
                    id,
                    reason: detail,
                    at: Utc::now(),
                });
            }
            RetryVerdict::Cancelled(reason) => {
                tracing::info!(?reason, "task cancelled");
                let failure = ExecutionFailure::Cancelled(reason);
                handler.errored(&ctx, &failure).await;
                let status = match reason {
                    CancelReason::User => TaskStatus::CancelledByUser,
                    CancelReason::Service => TaskStatus::CancelledByService,
                };
                self.finish_status(&task, status, None, persisted).await;
                self.publisher.emit(TaskLifecycleEvent::Cancelled {
                    id,
                    reason,
                    at: Utc::now(),
                });
            }
        }
    }

    /// Best-effort terminal status write, a storage failure here is logged and never
    /// unwinds into the worker
    async fn finish_status(
        &self,
        task: &PersistedTask,
        status: TaskStatus,
        detail: Option<FailureDetail>,
        persisted: bool,
    ) {
        if !persisted {
            return;
        }
        if let Err(err) = self.storage.set_status(&task.id, status, detail).await {
            tracing::warn!(task.id = %task.id, %status, %err, "failed to persist terminal status");
        }
    }

    /// Computes and schedules the next occurrence of a recurring series after a
    /// successful run
    async fn reschedule_recurring(
        &self,
        task: PersistedTask,
        handler: Arc<dyn ErasedTaskHandler>,
        persisted: bool,
    ) {
        let id = task.id;
        let Some(schedule) = task.recurring.clone() else {
            return;
        };
        let now = self.clock.now().await;
        // The drift anchor: the instant this run was scheduled for, as dequeued
        let anchor = task.scheduled_execution.unwrap_or(now);
        let completed = task.current_run_count + 1;

        let occurrence = match schedule.next_valid_run(anchor, completed, now) {
            Ok(occurrence) => occurrence,
            Err(err) => {
                tracing::error!(task.id = %id, %err, "failed to compute next occurrence");
                return;
            }
        };

        if occurrence.skipped_count > 0 {
            tracing::warn!(
                task.id = %id,
                skipped = occurrence.skipped_count,
                "recurring occurrences fell into the past and were skipped"
            );
            if persisted
                && self.storage.supports_skip_records()
                && let Err(err) = self
                    .storage
                    .record_skipped_occurrences(&id, &occurrence.skipped)
                    .await
            {
                tracing::warn!(task.id = %id, %err, "failed to record skipped occurrences");
            }
            self.publisher.emit(TaskLifecycleEvent::OccurrencesSkipped {
                id,
                count: occurrence.skipped_count,
                at: Utc::now(),
            });
        }

        if persisted
            && let Err(err) = self.storage.update_current_run(&id, occurrence.next).await
        {
            tracing::warn!(task.id = %id, %err, "failed to advance run counter");
        }

        let Some(next) = occurrence.next else {
            tracing::debug!(task.id = %id, "recurring series finished");
            return;
        };

        let mut updated = task;
        updated.status = TaskStatus::Pending;
        updated.current_run_count = completed;
        updated.scheduled_execution = Some(next);
        updated.next_run = Some(next);
        if persisted {
            if let Err(err) = self.storage.update_task(&updated).await {
                tracing::warn!(task.id = %id, %err, "failed to persist next occurrence");
            }
            if let Err(err) = self
                .storage
                .set_status(&id, TaskStatus::Pending, None)
                .await
            {
                tracing::warn!(task.id = %id, %err, "failed to reset status for next run");
            }
        }

        // Tight series keep the live handler, sparse ones reconstruct at execution
        let keep_handler = schedule
            .minimum_interval(now)
            .and_then(|gap| gap.to_std().ok())
            .is_some_and(|gap| gap < KEEP_HANDLER_THRESHOLD);

        tracing::debug!(task.id = %id, %next, "rescheduled recurring task");
        self.scheduler.schedule(
            ExecutionItem {
                task: updated,
                handler: keep_handler.then_some(handler),
            },
            next,
        );
    }
}
