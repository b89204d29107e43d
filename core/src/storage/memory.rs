use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;

use crate::errors::StorageError;
use crate::storage::{PageCursor, TaskStorage};
use crate::task::{FailureDetail, PersistedTask, StatusAudit, TaskId, TaskStatus};

/// [`InMemoryTaskStorage`] is the bundled [`TaskStorage`] implementation. It keeps every
/// row in process memory, which makes it fast and dependency-free but obviously not
/// durable across a process restart, for anything beyond demos and tests a real provider
/// should back the engine.
///
/// It implements the full contract including the skip-record capability, which also
/// makes it the reference implementation the integration tests run against
///
/// # See Also
/// - [`TaskStorage`]
pub struct InMemoryTaskStorage {
    tasks: DashMap<TaskId, PersistedTask>,
    audits: DashMap<TaskId, Vec<StatusAudit>>,
    skips: DashMap<TaskId, Vec<DateTime<Utc>>>,
    // Serializes key-conflict resolution in persist, everything else is lock-free
    dedup_guard: Mutex<()>,
}

impl Default for InMemoryTaskStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStorage {
    /// Creates / Constructs an empty [`InMemoryTaskStorage`]
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            audits: DashMap::new(),
            skips: DashMap::new(),
            dedup_guard: Mutex::new(()),
        }
    }

    /// The number of rows currently held
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no rows are held
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The skipped occurrences recorded for a task, exposed for inspection
    pub fn skipped_occurrences(&self, id: &TaskId) -> Vec<DateTime<Utc>> {
        self.skips.get(id).map(|s| s.clone()).unwrap_or_default()
    }

    fn push_audit(&self, task: &PersistedTask, status: TaskStatus, failure: Option<FailureDetail>) {
        if !task.audit_level.records(status) {
            return;
        }
        self.audits.entry(task.id).or_default().push(StatusAudit {
            task_id: task.id,
            status,
            at: Utc::now(),
            failure,
        });
    }
}

#[async_trait]
impl TaskStorage for InMemoryTaskStorage {
    async fn persist(&self, task: PersistedTask) -> Result<(), StorageError> {
        if let Some(key) = &task.task_key {
            let _guard = self.dedup_guard.lock().expect("dedup guard poisoned");
            let conflict = self
                .tasks
                .iter()
                .find(|row| row.task_key.as_deref() == Some(key.as_str()) && row.id != task.id)
                .map(|row| (row.id, row.status));
            if let Some((existing_id, status)) = conflict {
                if !status.is_terminal() {
                    return Err(StorageError::DuplicateKey(key.clone()));
                }
                // Terminal row with the same key is replaced by the new series
                self.tasks.remove(&existing_id);
                self.audits.remove(&existing_id);
                self.skips.remove(&existing_id);
            }
            self.push_audit(&task, task.status, None);
            self.tasks.insert(task.id, task);
            return Ok(());
        }
        self.push_audit(&task, task.status, None);
        self.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<PersistedTask>, StorageError> {
        Ok(self.tasks.get(id).map(|row| row.clone()))
    }

    async fn get_by_task_key(&self, key: &str) -> Result<Option<PersistedTask>, StorageError> {
        let mut newest_terminal: Option<PersistedTask> = None;
        for row in self.tasks.iter() {
            if row.task_key.as_deref() != Some(key) {
                continue;
            }
            if !row.status.is_terminal() {
                return Ok(Some(row.clone()));
            }
            let newer = newest_terminal
                .as_ref()
                .is_none_or(|current| row.cursor() > current.cursor());
            if newer {
                newest_terminal = Some(row.clone());
            }
        }
        Ok(newest_terminal)
    }

    async fn set_status(
        &self,
        id: &TaskId,
        status: TaskStatus,
        failure: Option<FailureDetail>,
    ) -> Result<(), StorageError> {
        let mut row = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        // Terminal states stay terminal, a late write from a racing path is dropped
        if row.status.is_terminal() && row.status != status {
            return Ok(());
        }
        row.status = status;
        let snapshot = row.clone();
        drop(row);
        self.push_audit(&snapshot, status, failure);
        Ok(())
    }

    async fn try_set_in_progress(&self, id: &TaskId) -> Result<bool, StorageError> {
        let mut row = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if !matches!(row.status, TaskStatus::Pending | TaskStatus::Queued) {
            return Ok(false);
        }
        row.status = TaskStatus::InProgress;
        let snapshot = row.clone();
        drop(row);
        self.push_audit(&snapshot, TaskStatus::InProgress, None);
        Ok(true)
    }

    async fn retrieve_pending(
        &self,
        cursor: Option<PageCursor>,
        page_size: usize,
    ) -> Result<Vec<PersistedTask>, StorageError> {
        let mut live: Vec<PersistedTask> = self
            .tasks
            .iter()
            .filter(|row| {
                matches!(
                    row.status,
                    TaskStatus::Pending | TaskStatus::Queued | TaskStatus::InProgress
                )
            })
            .filter(|row| cursor.is_none_or(|c| row.cursor() > c))
            .map(|row| row.clone())
            .collect();
        live.sort_by_key(|row| row.cursor());
        live.truncate(page_size);
        Ok(live)
    }

    async fn update_task(&self, task: &PersistedTask) -> Result<(), StorageError> {
        if !self.tasks.contains_key(&task.id) {
            return Err(StorageError::NotFound(task.id.to_string()));
        }
        self.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn current_run_count(&self, id: &TaskId) -> Result<u32, StorageError> {
        self.tasks
            .get(id)
            .map(|row| row.current_run_count)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn update_current_run(
        &self,
        id: &TaskId,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<u32, StorageError> {
        let mut row = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        row.current_run_count += 1;
        row.next_run = next_run;
        Ok(row.current_run_count)
    }

    async fn remove(&self, id: &TaskId) -> Result<(), StorageError> {
        self.tasks.remove(id);
        self.audits.remove(id);
        self.skips.remove(id);
        Ok(())
    }

    async fn audit_trail(&self, id: &TaskId) -> Result<Vec<StatusAudit>, StorageError> {
        Ok(self.audits.get(id).map(|a| a.clone()).unwrap_or_default())
    }

    fn supports_skip_records(&self) -> bool {
        true
    }

    async fn record_skipped_occurrences(
        &self,
        id: &TaskId,
        instants: &[DateTime<Utc>],
    ) -> Result<(), StorageError> {
        self.skips
            .entry(*id)
            .or_default()
            .extend_from_slice(instants);
        Ok(())
    }
}
