use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::task::TaskId;

#[allow(unused_imports)]
use crate::dispatcher::Dispatcher;

/// [`CancellationRegistry`] tracks one cancellation handle per live task. Handles are
/// created when execution begins (linked under the service shutdown token) or when a
/// cancel request arrives before execution, cancelling the handle reaches whichever
/// side holds it.
///
/// The map is lock-free with compare-and-swap insertion semantics: concurrent
/// [`CancellationRegistry::obtain`] calls for the same task converge on one token and
/// never leak a second source. Removal is idempotent
///
/// # See Also
/// - [`Dispatcher`]
pub struct CancellationRegistry {
    tokens: DashMap<TaskId, CancellationToken>,
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationRegistry {
    /// Creates / Constructs an empty [`CancellationRegistry`]
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    /// Returns the task's cancellation token, creating it as a child of `parent` when
    /// absent. Racing callers all receive clones of the same token
    pub fn obtain(&self, id: TaskId, parent: &CancellationToken) -> CancellationToken {
        self.tokens
            .entry(id)
            .or_insert_with(|| parent.child_token())
            .clone()
    }

    /// Signals the task's token if one is registered, returns whether a token existed
    pub fn cancel(&self, id: &TaskId) -> bool {
        match self.tokens.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drops the task's handle, a no-op when it was already removed
    pub fn remove(&self, id: &TaskId) {
        self.tokens.remove(id);
    }

    /// The number of live handles, exposed for diagnostics
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no handles are live
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// [`Blacklist`] is the small set of task ids marked "skip when dequeued". A cancel
/// request for a task that is still sitting in the scheduler or a queue lands here, the
/// worker consults the set right after dequeueing and drops the execution.
///
/// Reads are hot (every dequeue), writes are rare (explicit cancels), a single lock
/// around a plain set is all the structure this needs
pub struct Blacklist {
    ids: Mutex<HashSet<TaskId>>,
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new()
    }
}

impl Blacklist {
    /// Creates / Constructs an empty [`Blacklist`]
    pub fn new() -> Self {
        Self {
            ids: Mutex::new(HashSet::new()),
        }
    }

    /// Marks a task to be skipped at dequeue
    pub fn insert(&self, id: TaskId) {
        self.ids.lock().expect("blacklist lock poisoned").insert(id);
    }

    /// Whether the task is marked
    pub fn contains(&self, id: &TaskId) -> bool {
        self.ids
            .lock()
            .expect("blacklist lock poisoned")
            .contains(id)
    }

    /// Removes the mark, returns whether it was present
    pub fn take(&self, id: &TaskId) -> bool {
        self.ids.lock().expect("blacklist lock poisoned").remove(id)
    }
}
