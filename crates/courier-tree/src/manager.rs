//! Tree queue manager.
//!
//! Owns every conversation tree, the global id → tree index, and one FIFO
//! queue per tree. At most one worker runs per tree, so nodes of the same
//! tree are processed strictly one at a time in enqueue order while
//! unrelated trees proceed concurrently.
//!
//! All state sits behind a single [`parking_lot::Mutex`]. The lock is never
//! held across an `.await`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use courier_core::NodePayload;
use courier_core::metrics::TREE_NODES_CANCELLED_TOTAL;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, TreeError};
use crate::node::{MessageNode, MessageState};
use crate::tree::MessageTree;
use crate::worker::{Job, Processor, run_worker};

/// Error text for nodes found unfinished after a restart.
pub const LOST_ON_RESTART: &str = "Lost on restart";

/// Serialized form of a [`TreeQueueManager`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerSnapshot {
    /// Every tree keyed by its root id.
    pub trees: BTreeMap<String, MessageTree>,
    /// Node ids and aliases mapped to the root of their tree.
    pub node_to_tree: BTreeMap<String, String>,
}

pub(crate) struct WorkerHandle {
    pub(crate) id: u64,
    cancel: CancellationToken,
}

pub(crate) struct QueuedNode {
    pub(crate) node_id: String,
    pub(crate) processor: Processor,
}

pub(crate) struct TreeSlot {
    pub(crate) tree: MessageTree,
    pub(crate) queue: VecDeque<QueuedNode>,
    pub(crate) worker: Option<WorkerHandle>,
}

impl TreeSlot {
    fn new(tree: MessageTree) -> Self {
        Self {
            tree,
            queue: VecDeque::new(),
            worker: None,
        }
    }

    fn drop_queued(&mut self, ids: &HashSet<&str>) {
        self.queue.retain(|q| !ids.contains(q.node_id.as_str()));
    }
}

#[derive(Default)]
pub(crate) struct ManagerState {
    pub(crate) trees: BTreeMap<String, TreeSlot>,
    node_to_tree: HashMap<String, String>,
    next_worker_id: u64,
}

impl ManagerState {
    fn root_of(&self, id: &str) -> Result<&str> {
        self.node_to_tree
            .get(id)
            .map(String::as_str)
            .ok_or_else(|| TreeError::NodeNotFound(id.to_string()))
    }

    /// Slot owning the real node `node_id` (aliases are rejected).
    fn slot_for_node(&mut self, node_id: &str) -> Result<&mut TreeSlot> {
        let root_id = self.root_of(node_id)?.to_string();
        let slot = self
            .trees
            .get_mut(&root_id)
            .ok_or(TreeError::TreeNotFound(root_id))?;
        if !slot.tree.contains(node_id) {
            return Err(TreeError::NodeNotFound(node_id.to_string()));
        }
        Ok(slot)
    }

    fn ensure_unindexed(&self, id: &str) -> Result<()> {
        match self.node_to_tree.get(id) {
            Some(root_id) => Err(TreeError::AlreadyIndexed {
                id: id.to_string(),
                root_id: root_id.clone(),
            }),
            None => Ok(()),
        }
    }

    fn resolve(&self, id: &str) -> Option<String> {
        let slot = self.trees.get(self.node_to_tree.get(id)?)?;
        if slot.tree.contains(id) {
            return Some(id.to_string());
        }
        let by_status = slot
            .tree
            .nodes()
            .into_iter()
            .find(|n| n.payload.status_message_id == id)
            .map(|n| n.node_id.clone());
        Some(by_status.unwrap_or_else(|| slot.tree.root_id().to_string()))
    }
}

/// Shared handle to all conversation trees and their queues.
///
/// Cloning is cheap; clones share state. [`enqueue`](Self::enqueue) spawns
/// workers and must be called from within a Tokio runtime.
#[derive(Clone, Default)]
pub struct TreeQueueManager {
    inner: Arc<Mutex<ManagerState>>,
}

impl TreeQueueManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Tree lifecycle ──────────────────────────────────────────────────

    /// Start a new single-node tree rooted at `node_id`.
    #[instrument(skip(self, payload))]
    pub fn create_tree(&self, node_id: &str, payload: NodePayload) -> Result<MessageTree> {
        let mut state = self.inner.lock();
        state.ensure_unindexed(node_id)?;

        let tree = MessageTree::new(node_id, payload);
        let _ = state.node_to_tree.insert(node_id.to_string(), node_id.to_string());
        let _ = state.trees.insert(node_id.to_string(), TreeSlot::new(tree.clone()));
        debug!("tree created");
        Ok(tree)
    }

    /// Add `node_id` as a reply to `parent_node_id`, which may be a node id
    /// or an alias. The parent's state does not matter.
    #[instrument(skip(self, payload))]
    pub fn add_to_tree(
        &self,
        parent_node_id: &str,
        node_id: &str,
        payload: NodePayload,
    ) -> Result<(MessageTree, MessageNode)> {
        let mut state = self.inner.lock();
        let Some(parent_id) = state.resolve(parent_node_id) else {
            return Err(TreeError::ParentNotFound(parent_node_id.to_string()));
        };
        state.ensure_unindexed(node_id)?;

        let root_id = state.root_of(&parent_id)?.to_string();
        let slot = state
            .trees
            .get_mut(&root_id)
            .ok_or_else(|| TreeError::TreeNotFound(root_id.clone()))?;
        let node = slot.tree.add_child(&parent_id, node_id, payload)?.clone();
        let tree = slot.tree.clone();
        let _ = state.node_to_tree.insert(node_id.to_string(), root_id.clone());
        debug!(root_id = %root_id, parent_id = %parent_id, "node added");
        Ok((tree, node))
    }

    /// Make `alias_id` resolve to the tree containing `root_id`.
    ///
    /// Re-registering an alias for the same tree is a no-op; claiming an id
    /// owned by another tree fails.
    pub fn register_node(&self, alias_id: &str, root_id: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let target = state.root_of(root_id)?.to_string();
        if let Some(existing) = state.node_to_tree.get(alias_id) {
            if *existing == target {
                return Ok(());
            }
            return Err(TreeError::AlreadyIndexed {
                id: alias_id.to_string(),
                root_id: existing.clone(),
            });
        }
        let _ = state.node_to_tree.insert(alias_id.to_string(), target);
        Ok(())
    }

    /// Map a node id or alias to a real node id.
    ///
    /// A node id maps to itself. An alias maps to the node whose status
    /// message it is, falling back to the tree's root.
    pub fn resolve_parent_node_id(&self, id: &str) -> Option<String> {
        self.inner.lock().resolve(id)
    }

    /// Copy of the tree that `id` (node or alias) belongs to.
    pub fn get_tree_for_node(&self, id: &str) -> Option<MessageTree> {
        let state = self.inner.lock();
        let root_id = state.node_to_tree.get(id)?;
        state.trees.get(root_id).map(|slot| slot.tree.clone())
    }

    /// Copy of a node.
    pub fn get_node(&self, node_id: &str) -> Option<MessageNode> {
        let state = self.inner.lock();
        let root_id = state.node_to_tree.get(node_id)?;
        state.trees.get(root_id)?.tree.get_node(node_id).cloned()
    }

    /// Whether `id` is a node id or alias known to the manager.
    pub fn is_indexed(&self, id: &str) -> bool {
        self.inner.lock().node_to_tree.contains_key(id)
    }

    /// Number of trees.
    pub fn tree_count(&self) -> usize {
        self.inner.lock().trees.len()
    }

    /// Number of trees with an active worker.
    pub fn busy_tree_count(&self) -> usize {
        self.inner
            .lock()
            .trees
            .values()
            .filter(|slot| slot.worker.is_some())
            .count()
    }

    // ── Queueing ────────────────────────────────────────────────────────

    /// Queue `node_id` for processing.
    ///
    /// Returns `false` when the tree was idle and a worker started on this
    /// node right away, `true` when it joined the back of the tree's queue.
    /// The node must be PENDING.
    #[instrument(skip(self, processor))]
    pub fn enqueue(&self, node_id: &str, processor: Processor) -> Result<bool> {
        let mut state = self.inner.lock();
        let worker_id = state.next_worker_id;
        let slot = state.slot_for_node(node_id)?;

        if slot.worker.is_some() {
            let current = slot.tree.get_node(node_id).map(|n| n.state);
            if let Some(from) = current.filter(|s| *s != MessageState::Pending) {
                return Err(TreeError::InvalidTransition {
                    node_id: node_id.to_string(),
                    from,
                    to: MessageState::InProgress,
                });
            }
            slot.queue.push_back(QueuedNode {
                node_id: node_id.to_string(),
                processor,
            });
            debug!(position = slot.queue.len(), "node queued");
            return Ok(true);
        }

        let node = slot
            .tree
            .update_state(node_id, MessageState::InProgress, None)?
            .clone();
        let cancel = CancellationToken::new();
        slot.worker = Some(WorkerHandle {
            id: worker_id,
            cancel: cancel.clone(),
        });
        let root_id = slot.tree.root_id().to_string();
        state.next_worker_id += 1;
        drop(state);

        let job = Job {
            node_id: node_id.to_string(),
            node,
            processor,
        };
        let _ = tokio::spawn(run_worker(
            Arc::clone(&self.inner),
            root_id,
            worker_id,
            cancel,
            job,
        ));
        Ok(false)
    }

    /// Nodes waiting in the tree of `node_id`, excluding the one in progress.
    pub fn get_queue_size(&self, node_id: &str) -> usize {
        let state = self.inner.lock();
        state
            .node_to_tree
            .get(node_id)
            .and_then(|root| state.trees.get(root))
            .map_or(0, |slot| slot.queue.len())
    }

    /// Whether the tree of `node_id` has an active worker.
    pub fn is_node_tree_busy(&self, node_id: &str) -> bool {
        let state = self.inner.lock();
        state
            .node_to_tree
            .get(node_id)
            .and_then(|root| state.trees.get(root))
            .is_some_and(|slot| slot.worker.is_some())
    }

    // ── State updates ───────────────────────────────────────────────────

    /// Transition a node, returning the updated copy.
    ///
    /// A queued node moved to a terminal state is removed from its queue.
    pub fn update_node_state(
        &self,
        node_id: &str,
        new_state: MessageState,
        error_message: Option<String>,
    ) -> Result<MessageNode> {
        let mut state = self.inner.lock();
        let slot = state.slot_for_node(node_id)?;
        let node = slot.tree.update_state(node_id, new_state, error_message)?.clone();
        if new_state.is_terminal() {
            slot.drop_queued(&HashSet::from([node_id]));
        }
        Ok(node)
    }

    /// Record the agent session a node ran in.
    pub fn set_session_id(&self, node_id: &str, session_id: &str) -> Result<()> {
        let mut state = self.inner.lock();
        state.slot_for_node(node_id)?.tree.set_session_id(node_id, session_id)
    }

    /// Nearest ancestor session id of `node_id`.
    pub fn get_parent_session_id(&self, node_id: &str) -> Option<String> {
        let state = self.inner.lock();
        let root_id = state.node_to_tree.get(node_id)?;
        state
            .trees
            .get(root_id)?
            .tree
            .get_parent_session_id(node_id)
            .map(str::to_string)
    }

    /// Mark a node ERROR, optionally failing its PENDING descendants too.
    ///
    /// Returns every affected node, origin first, descendants breadth-first.
    /// Completed and in-progress descendants are left alone. Fails if the
    /// origin is already terminal.
    #[instrument(skip(self))]
    pub fn mark_node_error(
        &self,
        node_id: &str,
        message: &str,
        propagate_to_children: bool,
    ) -> Result<Vec<MessageNode>> {
        let mut state = self.inner.lock();
        let slot = state.slot_for_node(node_id)?;

        let origin = slot
            .tree
            .update_state(node_id, MessageState::Error, Some(message.to_string()))?
            .clone();
        let mut affected = vec![origin];

        if propagate_to_children {
            let derived = format!("Parent task failed: {message}");
            for id in slot.tree.descendants(node_id) {
                let pending = slot
                    .tree
                    .get_node(&id)
                    .is_some_and(|n| n.state == MessageState::Pending);
                if !pending {
                    continue;
                }
                let node = slot
                    .tree
                    .update_state(&id, MessageState::Error, Some(derived.clone()))?;
                affected.push(node.clone());
            }
        }

        let ids: HashSet<&str> = affected.iter().map(|n| n.node_id.as_str()).collect();
        slot.drop_queued(&ids);
        info!(affected = affected.len(), "node marked error");
        Ok(affected)
    }

    /// Stop everything: cancel all workers, clear all queues, and move every
    /// PENDING and IN_PROGRESS node to CANCELLED in one critical section.
    ///
    /// Returns the affected nodes. Afterwards no tree is busy.
    pub fn cancel_all_sync(&self) -> Vec<MessageNode> {
        let mut state = self.inner.lock();
        let mut affected = Vec::new();

        for slot in state.trees.values_mut() {
            if let Some(worker) = slot.worker.take() {
                worker.cancel.cancel();
            }
            slot.queue.clear();
            let active: Vec<String> = slot
                .tree
                .nodes()
                .into_iter()
                .filter(|n| !n.state.is_terminal())
                .map(|n| n.node_id.clone())
                .collect();
            for id in active {
                if let Ok(node) = slot.tree.update_state(&id, MessageState::Cancelled, None) {
                    affected.push(node.clone());
                }
            }
        }

        counter!(TREE_NODES_CANCELLED_TOTAL).increment(affected.len() as u64);
        info!(cancelled = affected.len(), "cancelled all trees");
        affected
    }

    /// Fail every PENDING or IN_PROGRESS node left over from a previous run.
    ///
    /// Returns how many nodes changed.
    pub fn cleanup_stale_nodes(&self) -> usize {
        let mut state = self.inner.lock();
        let mut changed = 0;

        for slot in state.trees.values_mut() {
            slot.queue.clear();
            let stale: Vec<String> = slot
                .tree
                .nodes()
                .into_iter()
                .filter(|n| !n.state.is_terminal())
                .map(|n| n.node_id.clone())
                .collect();
            for id in stale {
                let lost = Some(LOST_ON_RESTART.to_string());
                if slot.tree.update_state(&id, MessageState::Error, lost).is_ok() {
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            warn!(changed, "marked stale nodes as failed");
        }
        changed
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Structural copy of all trees and the id index.
    pub fn to_snapshot(&self) -> ManagerSnapshot {
        let state = self.inner.lock();
        ManagerSnapshot {
            trees: state
                .trees
                .iter()
                .map(|(root, slot)| (root.clone(), slot.tree.clone()))
                .collect(),
            node_to_tree: state
                .node_to_tree
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Rebuild a manager from a snapshot. No workers are running afterwards.
    ///
    /// Every tree node is indexed even if the snapshot's index omits it.
    /// Aliases pointing at unknown trees are dropped.
    pub fn from_snapshot(snapshot: ManagerSnapshot) -> Result<Self> {
        let ManagerSnapshot {
            trees,
            node_to_tree: aliases,
        } = snapshot;
        let mut state = ManagerState::default();

        for (root_id, tree) in trees {
            if tree.root_id() != root_id {
                return Err(TreeError::InvalidSnapshot(format!(
                    "tree keyed {root_id} has root {}",
                    tree.root_id()
                )));
            }
            for node in tree.nodes() {
                if let Some(owner) = state.node_to_tree.get(&node.node_id) {
                    return Err(TreeError::InvalidSnapshot(format!(
                        "node {} appears in trees {owner} and {root_id}",
                        node.node_id
                    )));
                }
                let _ = state
                    .node_to_tree
                    .insert(node.node_id.clone(), root_id.clone());
            }
            let _ = state.trees.insert(root_id, TreeSlot::new(tree));
        }

        for (id, root_id) in aliases {
            if !state.trees.contains_key(&root_id) {
                warn!(id = %id, root_id = %root_id, "dropping alias to unknown tree");
                continue;
            }
            match state.node_to_tree.get(&id) {
                Some(owner) if *owner != root_id => {
                    return Err(TreeError::InvalidSnapshot(format!(
                        "id {id} indexed to {root_id} but owned by {owner}"
                    )));
                }
                Some(_) => {}
                None => {
                    let _ = state.node_to_tree.insert(id, root_id);
                }
            }
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(state)),
        })
    }
}

impl std::fmt::Debug for TreeQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("TreeQueueManager")
            .field("trees", &state.trees.len())
            .field("indexed", &state.node_to_tree.len())
            .finish_non_exhaustive()
    }
}
