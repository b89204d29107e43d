pub mod memory;

pub use memory::InMemoryTaskStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::StorageError;
use crate::task::{FailureDetail, PersistedTask, StatusAudit, TaskId, TaskStatus};

#[allow(unused_imports)]
use crate::task::AuditLevel;

/// The keyset cursor of a pagination pass: the `(created_at, id)` pair of the last row
/// of the previous page. Cursor-based paging keeps memory bounded by the page size no
/// matter how large the backlog is, which OFFSET-style paging cannot guarantee
pub type PageCursor = (DateTime<Utc>, TaskId);

/// [`TaskStorage`] is the durability contract of the engine. One implementation ships
/// in-process ([`InMemoryTaskStorage`]), everything else (SQL providers and so on) lives
/// outside the engine and only has to honor this trait.
///
/// # Contract Note(s)
/// - [`TaskStorage::persist`] applies the task-key dedup rules when the key conflicts:
///   a conflicting *terminal* row is replaced, a conflicting non-terminal row is a
///   [`StorageError::DuplicateKey`] (the dispatcher resolves non-terminal conflicts
///   before persisting, the error only surfaces under racing writers)
/// - [`TaskStorage::set_status`] must write the status and its audit row atomically
///   (as one unit of consistency), the audit row is elided when the task's
///   [`AuditLevel`] does not record the transition. A terminal status is never
///   overwritten with a different one, late best-effort writes from racing paths
///   are dropped silently
/// - [`TaskStorage::try_set_in_progress`] is the compare-and-swap protecting the
///   `Pending`/`Queued` to `InProgress` transition, it returns `false` when the task
///   is in any other state and must never overwrite a terminal status
/// - [`TaskStorage::retrieve_pending`] pages with a keyset cursor ordered by
///   `(created_at, id)` ascending, implementations must honor that ordering
/// - The engine opens its storage interactions per task execution and never shares
///   in-flight state across executions, implementations may assume call-level (not
///   session-level) thread safety
///
/// # Capability Probe(s)
/// Recording skipped occurrences is optional. Implementations that support it override
/// [`TaskStorage::supports_skip_records`] to return `true`, the engine probes it and
/// silently skips the write otherwise
///
/// # See Also
/// - [`InMemoryTaskStorage`]
/// - [`PersistedTask`]
#[async_trait]
pub trait TaskStorage: Send + Sync + 'static {
    /// Inserts the task, applying the task-key dedup rules on conflict
    async fn persist(&self, task: PersistedTask) -> Result<(), StorageError>;

    /// Fetches one task by id
    async fn get(&self, id: &TaskId) -> Result<Option<PersistedTask>, StorageError>;

    /// Fetches the task owning the given key, terminal or not. When several rows ever
    /// carried the key the non-terminal one wins, otherwise the newest
    async fn get_by_task_key(&self, key: &str) -> Result<Option<PersistedTask>, StorageError>;

    /// Writes a status transition together with its audit row
    async fn set_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        failure: Option<FailureDetail>,
    ) -> Result<(), StorageError>;

    /// Atomically moves a `Pending` or `Queued` task to `InProgress`, returning whether
    /// the transition happened
    async fn try_set_in_progress(&self, id: &TaskId) -> Result<bool, StorageError>;

    /// One keyset page of tasks in a live state (`Pending`, `Queued`, `InProgress`),
    /// ordered by `(created_at, id)` ascending, strictly after `cursor`
    async fn retrieve_pending(
        &self,
        cursor: Option<PageCursor>,
        page_size: usize,
    ) -> Result<Vec<PersistedTask>, StorageError>;

    /// Full overwrite of the task row (scheduling fields included)
    async fn update_task(&self, task: &PersistedTask) -> Result<(), StorageError>;

    /// The number of completed runs recorded for the task
    async fn current_run_count(&self, id: &TaskId) -> Result<u32, StorageError>;

    /// Increments the completed-run counter and stores the next scheduled occurrence,
    /// returning the new counter value
    async fn update_current_run(
        &self,
        id: &TaskId,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<u32, StorageError>;

    /// Removes the task row and its children
    async fn remove(&self, id: &TaskId) -> Result<(), StorageError>;

    /// The audit trail of the task, oldest first
    async fn audit_trail(&self, id: &TaskId) -> Result<Vec<StatusAudit>, StorageError>;

    /// Whether [`TaskStorage::record_skipped_occurrences`] is meaningful for this
    /// provider
    fn supports_skip_records(&self) -> bool {
        false
    }

    /// Records occurrences a recurring task missed (downtime, long delays) with their
    /// intended instants. Only invoked when [`TaskStorage::supports_skip_records`]
    /// returns `true`
    async fn record_skipped_occurrences(
        &self,
        _id: &TaskId,
        _instants: &[DateTime<Utc>],
    ) -> Result<(), StorageError> {
        Ok(())
    }
}
