use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::retry::RetryPolicy;
use crate::schedule::RecurringSchedule;

#[allow(unused_imports)]
use crate::dispatcher::Dispatcher;

#[allow(unused_imports)]
use crate::registry::HandlerRegistry;

/// The boxed error type handlers return from [`TaskHandler::handle`]. Any error type can
/// flow through it, the engine flattens the source chain into the persisted failure detail
pub type HandlerError = Box<dyn Error + Send + Sync + 'static>;

/// [`TaskId`] is the identity of one logical task across its whole lifetime, including
/// process restarts. Generation produces time-ordered UUID v7 values so that storage
/// indexes over `(created_at, id)` stay compact, a custom generator can be plugged in
/// through the engine configuration
///
/// # Trait Implementation(s)
/// [`TaskId`] is a transparent newtype over [`Uuid`] and implements [`Display`],
/// [`Ord`] (byte order, which for v7 values is creation order) alongside the usual
/// derive set, plus serde both ways
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh time-ordered id
    pub fn generate() -> Self {
        TaskId(Uuid::now_v7())
    }

    /// Views the wrapped [`Uuid`]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        TaskId(value)
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// [`TaskRequest`] marks a value as dispatchable through the engine. A request is an opaque,
/// serializable description of one unit of work, the engine persists it as a
/// `(request type, JSON payload)` pair and never inspects the payload itself
///
/// # Required Item(s)
/// Implementors supply [`TaskRequest::request_type`], a stable, unique name for the request
/// type. The name is persisted alongside the payload and used to find the registered handler
/// again after a restart, renaming it orphans previously persisted tasks
///
/// # Example
/// ```ignore
/// use evertask::task::TaskRequest;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct SendWelcomeMail {
///     user_id: u64,
/// }
///
/// impl TaskRequest for SendWelcomeMail {
///     fn request_type() -> &'static str {
///         "notifications.send_welcome_mail"
///     }
/// }
/// ```
///
/// # See Also
/// - [`TaskHandler`]
/// - [`Dispatcher`]
pub trait TaskRequest: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The stable name this request type is persisted and routed under
    fn request_type() -> &'static str;
}

/// [`ExecutionContext`] is handed to a handler for each run. It exposes the task identity,
/// the run counter, the instant the run was scheduled for and the composed cancellation
/// token (service shutdown, user cancellation and timeout all funnel into it)
///
/// Handlers are expected to honor the token at their own suspension points, the engine
/// cannot interrupt non-cooperative work
#[derive(Clone, Debug)]
pub struct ExecutionContext {
    task_id: TaskId,
    run_count: u32,
    scheduled_for: Option<DateTime<Utc>>,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub(crate) fn new(
        task_id: TaskId,
        run_count: u32,
        scheduled_for: Option<DateTime<Utc>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            task_id,
            run_count,
            scheduled_for,
            cancellation,
        }
    }

    /// The id of the task being executed
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// How many runs completed before this one, zero for the first run
    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    /// The instant this run was scheduled for, `None` for as-soon-as-possible work
    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        self.scheduled_for
    }

    /// The composed cancellation token for this run
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether cancellation has been requested for this run
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// [`TaskHandler`] is the polymorphic executor for one request type. Registering it in the
/// [`HandlerRegistry`] is what makes the request type dispatchable
///
/// # Required Method(s)
/// Only [`TaskHandler::handle`] must be implemented, it receives the deserialized request
/// and the per-run [`ExecutionContext`]. The lifecycle callbacks and the per-handler
/// configuration overrides all default to no-ops / `None`
///
/// # Lifecycle Callback(s)
/// - [`TaskHandler::on_started`] fires right after the task transitions to in-progress
/// - [`TaskHandler::on_completed`] fires after a successful run
/// - [`TaskHandler::on_error`] fires after retries are exhausted, on timeout and on
///   cancellation, with the concrete [`ExecutionFailure`]
/// - [`TaskHandler::on_retry`] fires between attempts, never before the first, with
///   1-based attempt numbers
///
/// Resource disposal maps onto [`Drop`], the engine drops the handler instance once the
/// run (including callbacks) is over
///
/// # Configuration Override(s)
/// [`TaskHandler::retry_policy`], [`TaskHandler::timeout`] and [`TaskHandler::queue_name`]
/// override the engine-wide defaults for this handler type only. The engine resolves and
/// caches them once per handler type
///
/// # See Also
/// - [`TaskRequest`]
/// - [`ExecutionContext`]
/// - [`RetryPolicy`]
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// The request type this handler executes
    type Request: TaskRequest;

    /// Executes one run of the task
    async fn handle(
        &self,
        request: Self::Request,
        ctx: ExecutionContext,
    ) -> Result<(), HandlerError>;

    /// Fired right after the task is marked in-progress
    async fn on_started(&self, _ctx: &ExecutionContext) {}

    /// Fired after a successful run
    async fn on_completed(&self, _ctx: &ExecutionContext) {}

    /// Fired when the run ends in failure, timeout or cancellation
    async fn on_error(&self, _ctx: &ExecutionContext, _failure: &ExecutionFailure) {}

    /// Fired between attempts with the 1-based attempt number that just failed,
    /// the error it produced and the delay before the next attempt
    async fn on_retry(
        &self,
        _ctx: &ExecutionContext,
        _attempt: u32,
        _error: &HandlerError,
        _delay: Duration,
    ) {
    }

    /// Per-handler retry policy, falls back to the engine default when `None`
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Per-handler execution timeout, falls back to the engine default when `None`
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Per-handler target queue, falls back to the routing rules when `None`
    fn queue_name(&self) -> Option<&str> {
        None
    }
}

/// The reason a run was cancelled, used to pick the terminal status and surfaced
/// through [`TaskHandler::on_error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// The cancel API was invoked for this task
    User,
    /// The engine is shutting down
    Service,
}

/// [`ExecutionFailure`] describes how a run ended when it did not complete. The three kinds
/// are kept apart because they map to different terminal statuses and different retry
/// treatment (timeouts and cancellations are not retried by the default policy)
#[derive(Debug)]
pub enum ExecutionFailure {
    /// The handler returned an error and retries are exhausted
    Error(FailureDetail),
    /// The run exceeded its resolved timeout
    TimedOut { after: Duration },
    /// The run was cancelled by the user or by service shutdown
    Cancelled(CancelReason),
}

impl ExecutionFailure {
    /// Renders the failure into the detail persisted with the `Failed` status
    pub fn detail(&self) -> FailureDetail {
        match self {
            ExecutionFailure::Error(detail) => detail.clone(),
            ExecutionFailure::TimedOut { after } => {
                FailureDetail::from_message(format!("Execution timed out after {after:?}"))
            }
            ExecutionFailure::Cancelled(CancelReason::User) => {
                FailureDetail::from_message("Cancelled by user request")
            }
            ExecutionFailure::Cancelled(CancelReason::Service) => {
                FailureDetail::from_message("Cancelled by service shutdown")
            }
        }
    }
}

/// [`FailureDetail`] is the persisted rendition of an error, the top-level message plus
/// the flattened source chain (outermost first)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureDetail {
    pub message: String,
    pub chain: Vec<String>,
}

impl FailureDetail {
    /// Builds a detail from a bare message with an empty chain
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            chain: Vec::new(),
        }
    }

    /// Builds a detail from a handler error, walking and flattening its source chain
    pub fn from_error(error: &HandlerError) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: error.to_string(),
            chain,
        }
    }
}

impl Display for FailureDetail {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for cause in &self.chain {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// The lifecycle states of a persisted task. `Pending`, `Queued` and `InProgress` are
/// live states, the rest are terminal. Status advances monotonically toward a terminal
/// state except across a re-dispatch after a crash, where a live state is entered again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Persisted, waiting for its scheduled instant (or for a queue slot)
    Pending,
    /// Sitting in an execution queue
    Queued,
    /// A worker is currently executing it
    InProgress,
    /// The run (or the final run of a recurring series) succeeded
    Completed,
    /// Retries exhausted, timed out, or the record could not be recovered
    Failed,
    /// Cancelled through the cancel API
    CancelledByUser,
    /// Cancelled by service shutdown
    CancelledByService,
}

impl TaskStatus {
    /// Whether this status ends the task's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::CancelledByUser
                | TaskStatus::CancelledByService
        )
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Queued => "Queued",
            TaskStatus::InProgress => "InProgress",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::CancelledByUser => "CancelledByUser",
            TaskStatus::CancelledByService => "CancelledByService",
        };
        f.write_str(name)
    }
}

/// How much history the storage provider retains for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuditLevel {
    /// No audit rows at all
    Off,
    /// Only failures and cancellations
    ErrorsOnly,
    /// Every status transition
    #[default]
    Full,
}

impl AuditLevel {
    /// Whether a transition to `status` should produce an audit row under this level
    pub fn records(&self, status: TaskStatus) -> bool {
        match self {
            AuditLevel::Off => false,
            AuditLevel::ErrorsOnly => matches!(
                status,
                TaskStatus::Failed
                    | TaskStatus::CancelledByUser
                    | TaskStatus::CancelledByService
            ),
            AuditLevel::Full => true,
        }
    }
}

/// One audit row, recording a status transition of a task together with the failure
/// detail when the transition carried one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusAudit {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
    pub failure: Option<FailureDetail>,
}

/// [`PersistedTask`] is the canonical durable record of one logical task, one row per
/// task. It is what the storage contract persists, what recovery reads back after a
/// restart and what travels (by value) through the scheduler and the queues
///
/// # Field Note(s)
/// - `scheduled_execution` holds the instant the task *should* run next, `None` means as
///   soon as possible. For recurring tasks it always holds the scheduled instant of the
///   upcoming run, never the wall-clock time it actually started, every drift correction
///   derives from it
/// - `current_run_count` counts completed runs and only grows for recurring tasks
/// - `task_key` is the caller-supplied idempotency key, unique among non-terminal rows
///
/// # See Also
/// - [`TaskStatus`]
/// - [`RecurringSchedule`]
/// - [`StatusAudit`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedTask {
    pub id: TaskId,
    pub task_key: Option<String>,
    pub request_type: String,
    pub request_payload: String,
    pub handler_type: String,
    pub queue_name: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub scheduled_execution: Option<DateTime<Utc>>,
    pub recurring: Option<RecurringSchedule>,
    pub current_run_count: u32,
    pub next_run: Option<DateTime<Utc>>,
    pub audit_level: AuditLevel,
}

impl PersistedTask {
    /// Whether this task carries a recurring schedule
    pub fn is_recurring(&self) -> bool {
        self.recurring.is_some()
    }

    /// The keyset cursor position of this row, ordered by `(created_at, id)`
    pub fn cursor(&self) -> (DateTime<Utc>, TaskId) {
        (self.created_at, self.id)
    }
}
