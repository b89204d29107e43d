use std::sync::Arc;

use crate::dispatcher::Dispatcher;
use crate::storage::{PageCursor, TaskStorage};

#[allow(unused_imports)]
use crate::engine::EverTask;

/// Rows fetched per keyset page. Memory use of a recovery pass is bounded by this and
/// never by the backlog size
const RECOVERY_PAGE_SIZE: usize = 100;

/// The startup recovery pass: pages through every task left in a live state
/// (`Pending`, `Queued` and `InProgress`, the last meaning a previous instance crashed
/// mid-run) and re-dispatches each one under its persisted id so it resumes as the same
/// logical task.
///
/// Pagination is keyset-based over `(created_at, id)`, each page is processed before
/// the next is fetched. Individual failures (unreadable payloads, missing handlers) are
/// marked `Failed` by the dispatcher and never abort the pass. Runs after the workers
/// are up, so re-enqueued work flows with the same parallelism as live work
///
/// # See Also
/// - [`Dispatcher`]
/// - [`EverTask`]
pub(crate) async fn run(storage: &Arc<dyn TaskStorage>, dispatcher: &Dispatcher) -> usize {
    let mut cursor: Option<PageCursor> = None;
    let mut recovered = 0usize;

    loop {
        let page = match storage.retrieve_pending(cursor, RECOVERY_PAGE_SIZE).await {
            Ok(page) => page,
            Err(err) => {
                tracing::error!(%err, "recovery pass aborted, storage unavailable");
                break;
            }
        };
        let Some(last) = page.last() else {
            break;
        };
        cursor = Some(last.cursor());
        let page_len = page.len();

        for task in page {
            let id = task.id;
            match dispatcher.redispatch(task).await {
                Ok(()) => recovered += 1,
                Err(err) => {
                    tracing::warn!(task.id = %id, %err, "failed to re-dispatch recovered task");
                }
            }
        }

        if page_len < RECOVERY_PAGE_SIZE {
            break;
        }
    }

    if recovered > 0 {
        tracing::info!(recovered, "recovery pass re-dispatched unfinished tasks");
    } else {
        tracing::debug!("recovery pass found no unfinished tasks");
    }
    recovered
}
