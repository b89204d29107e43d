use thiserror::Error;

#[allow(unused_imports)]
use crate::queue::QueueFullBehavior;

/// [`EverTaskError`] is the main enum that contains all the errors which can be surfaced by
/// the engine, it uses under the hood [`thiserror`] to make it as smooth sailing to add more
/// errors in the future as possible. Configuration errors are fatal to the operation that
/// produced them and never to the running service
#[derive(Error, Debug)]
pub enum EverTaskError {
    /// This error is meant to happen when a request is dispatched while no handler has been
    /// registered for its request type. Registration must happen before the engine starts
    #[error("No handler registered for request type `{0}`")]
    NoHandlerRegistered(String),

    /// This error is meant to happen when the request payload cannot be serialized to its
    /// persisted form, or a persisted payload cannot be brought back
    #[error("Serialization of request type `{0}` failed: {1}")]
    SerializationFailed(String, String),

    /// This error is meant to happen when the storage provider fails to persist or update a
    /// task. Whether it aborts the dispatch is governed by the persistence policy of
    /// the engine configuration
    #[error("Persistence operation failed for task `{0}`: {1}")]
    PersistenceFailed(String, String),

    /// This error is meant to happen when two racing writers dispatch the same task key and
    /// the storage provider cannot order them. Callers observing this should retry the
    /// dispatch, the winner's row is authoritative
    #[error("Task key `{0}` conflicted under concurrent dispatch")]
    DuplicateKeyConflict(String),

    /// This error is meant to happen when a bounded queue is full and its overflow behavior
    /// is [`QueueFullBehavior::Reject`] (or the fallback target is itself full)
    #[error("Queue `{queue}` is full, task `{task_id}` was rejected")]
    QueueFull { queue: String, task_id: String },

    /// This error is meant to happen when a recurring schedule cannot be honored, either
    /// because a cron expression is malformed or because a constraint describes an empty
    /// search space (for example an hour above 23 or a day-of-month of zero)
    #[error("Invalid recurring schedule: {0}")]
    InvalidSchedule(String),

    /// This error is meant to happen when a retry policy narrows its filter with both a
    /// whitelist and a blacklist. The two are mutually exclusive
    #[error("Retry filters conflict: a policy cannot both whitelist and blacklist errors")]
    ConflictingRetryFilters,

    /// This error is meant to happen when the engine configuration cannot be honored,
    /// for example a queue with zero capacity
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// This error is meant to happen when a dispatch arrives after the engine has begun
    /// shutting down and no longer accepts new work
    #[error("The engine is shutting down and no longer accepts dispatches")]
    ShuttingDown,

    /// This error is meant to happen when an operation references a task id unknown to
    /// the storage provider
    #[error("Task `{0}` was not found")]
    TaskNotFound(String),
}

/// [`StorageError`] is the error surface of the storage contract. Provider implementations
/// map their native failures onto these kinds, the engine maps them onto [`EverTaskError`]
/// at its own boundary
#[derive(Error, Debug)]
pub enum StorageError {
    /// The referenced task id has no row
    #[error("No persisted task with id `{0}`")]
    NotFound(String),

    /// A non-terminal row already owns the task key and the provider could not order the
    /// writers
    #[error("Task key `{0}` is already owned by a non-terminal task")]
    DuplicateKey(String),

    /// Any provider-side I/O or consistency failure
    #[error("Storage failure: {0}")]
    Io(String),
}

impl EverTaskError {
    /// Maps a [`StorageError`] onto the engine error surface, attaching the id of the
    /// task whose operation failed
    pub(crate) fn from_storage(task_id: impl ToString, err: StorageError) -> Self {
        match err {
            StorageError::DuplicateKey(key) => EverTaskError::DuplicateKeyConflict(key),
            StorageError::NotFound(id) => EverTaskError::TaskNotFound(id),
            StorageError::Io(msg) => EverTaskError::PersistenceFailed(task_id.to_string(), msg),
        }
    }
}
