//! Per-tree worker task.
//!
//! A worker drains one tree's queue sequentially. It is spawned by
//! [`TreeQueueManager::enqueue`](crate::TreeQueueManager::enqueue) when the
//! tree has no active worker, and exits when the queue is empty or its
//! cancellation token fires.

use std::sync::Arc;

use courier_core::metrics::{
    TREE_NODES_PROCESSED_TOTAL, TREE_PROCESSOR_FAILURES_TOTAL, TREE_WORKERS_ACTIVE,
};
use futures::future::BoxFuture;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::manager::ManagerState;
use crate::node::{MessageNode, MessageState};

/// Future returned by a [`Processor`].
pub type ProcessorFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Callback that does the actual work for a node.
///
/// Receives the node id and a snapshot of the node (already IN_PROGRESS).
/// The processor owns the node's final transition; the worker only logs a
/// returned error and moves on. A processor that fails or panics without
/// settling its node leaves it IN_PROGRESS while the next queued node
/// starts, so "one IN_PROGRESS node per tree" holds only for processors
/// that settle their node on every path.
pub type Processor = Arc<dyn Fn(String, MessageNode) -> ProcessorFuture + Send + Sync>;

/// Wrap an async closure as a [`Processor`].
pub fn processor<F, Fut>(f: F) -> Processor
where
    F: Fn(String, MessageNode) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |node_id, node| Box::pin(f(node_id, node)))
}

/// One unit of work handed to a worker.
pub(crate) struct Job {
    pub(crate) node_id: String,
    pub(crate) node: MessageNode,
    pub(crate) processor: Processor,
}

/// Drain a tree's queue until it is empty or `cancel` fires.
#[instrument(skip_all, fields(root_id = %root_id, worker_id = worker_id))]
pub(crate) async fn run_worker(
    state: Arc<Mutex<ManagerState>>,
    root_id: String,
    worker_id: u64,
    cancel: CancellationToken,
    first: Job,
) {
    gauge!(TREE_WORKERS_ACTIVE).increment(1.0);
    debug!("worker started");

    let mut next = Some(first);
    while let Some(Job {
        node_id,
        node,
        processor,
    }) = next.take()
    {
        if cancel.is_cancelled() {
            break;
        }
        counter!(TREE_NODES_PROCESSED_TOTAL).increment(1);

        let mut task = tokio::spawn((processor)(node_id.clone(), node));
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                task.abort();
                info!(node_id = %node_id, "processing cancelled");
                break;
            }
            joined = &mut task => match joined {
                Ok(Ok(())) => debug!(node_id = %node_id, "node processed"),
                Ok(Err(e)) => {
                    counter!(TREE_PROCESSOR_FAILURES_TOTAL).increment(1);
                    warn!(node_id = %node_id, error = %e, "processor failed");
                }
                Err(e) if e.is_panic() => {
                    counter!(TREE_PROCESSOR_FAILURES_TOTAL).increment(1);
                    error!(node_id = %node_id, "processor panicked");
                }
                Err(e) => warn!(node_id = %node_id, error = %e, "processor task aborted"),
            }
        }

        next = next_job(&state, &root_id, worker_id);
    }

    gauge!(TREE_WORKERS_ACTIVE).decrement(1.0);
    debug!("worker stopped");
}

/// Pop the next startable node, or release the tree's worker slot.
///
/// Queued nodes that were moved out of PENDING while waiting are skipped.
/// A worker that was replaced (after a cancel) never touches the new slot.
fn next_job(state: &Mutex<ManagerState>, root_id: &str, worker_id: u64) -> Option<Job> {
    let mut guard = state.lock();
    let slot = guard.trees.get_mut(root_id)?;
    if slot.worker.as_ref().map(|w| w.id) != Some(worker_id) {
        return None;
    }
    while let Some(queued) = slot.queue.pop_front() {
        match slot.tree.update_state(&queued.node_id, MessageState::InProgress, None) {
            Ok(node) => {
                return Some(Job {
                    node: node.clone(),
                    node_id: queued.node_id,
                    processor: queued.processor,
                });
            }
            Err(e) => debug!(node_id = %queued.node_id, error = %e, "skipping queued node"),
        }
    }
    slot.worker = None;
    None
}
