//! EverTask is an in-process background-task engine: describe a unit of work as a
//! serializable request, register a handler for it, and dispatch. The engine persists
//! the task, schedules it (immediately, delayed or recurring), routes it to a named
//! bounded queue, executes it under retry, timeout and cancellation policies, publishes
//! lifecycle events, and resumes whatever was left unfinished after a process restart.

pub mod cancellation;

pub mod clock;

pub mod config;

pub mod dispatcher;

pub mod engine;

pub mod errors;

mod executor;

pub mod monitoring;

pub mod queue;

mod recovery;

pub mod registry;

pub mod retry;

pub mod schedule;

pub mod scheduler;

pub mod storage;

pub mod task;

mod worker;

pub use config::{EverTaskConfig, QueueConfig};
pub use dispatcher::DispatchMode;
pub use engine::EverTask;
pub use errors::{EverTaskError, StorageError};
pub use queue::QueueFullBehavior;
pub use retry::RetryPolicy;
pub use schedule::{CronExpression, RecurringSchedule};
pub use task::{
    ExecutionContext, HandlerError, PersistedTask, TaskHandler, TaskId, TaskRequest, TaskStatus,
};
