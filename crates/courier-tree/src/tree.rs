//! A conversation tree: one root message and the replies branching from it.
//!
//! Nodes live in an id-keyed arena and reference each other by id, so there
//! are no ownership cycles between parents and children.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::Utc;
use courier_core::NodePayload;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TreeError};
use crate::node::{MessageNode, MessageState};

/// Serialized form of a [`MessageTree`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    /// Id of the root node.
    pub root_id: String,
    /// Every node keyed by its id.
    pub nodes: BTreeMap<String, MessageNode>,
}

/// A rooted tree of [`MessageNode`]s.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TreeSnapshot", into = "TreeSnapshot")]
pub struct MessageTree {
    root_id: String,
    nodes: HashMap<String, MessageNode>,
}

impl MessageTree {
    /// Start a tree from a PENDING root.
    pub fn new(root_id: impl Into<String>, payload: NodePayload) -> Self {
        let root_id = root_id.into();
        let root = MessageNode::new(root_id.clone(), payload, None);
        let mut nodes = HashMap::new();
        let _ = nodes.insert(root_id.clone(), root);
        Self { root_id, nodes }
    }

    /// Id of the root node.
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// The root node.
    pub fn get_root(&self) -> &MessageNode {
        // Constructors always insert the root and nodes are never removed.
        &self.nodes[&self.root_id]
    }

    /// Look up a node by id.
    pub fn get_node(&self, node_id: &str) -> Option<&MessageNode> {
        self.nodes.get(node_id)
    }

    /// Whether the tree holds a node with this id.
    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; a tree has at least its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in breadth-first order from the root.
    pub fn nodes(&self) -> Vec<&MessageNode> {
        let mut out = Vec::with_capacity(self.nodes.len());
        out.push(self.get_root());
        out.extend(self.descendants(&self.root_id).iter().filter_map(|id| self.nodes.get(id)));
        out
    }

    /// Attach a new PENDING child under `parent_id`.
    pub fn add_child(
        &mut self,
        parent_id: &str,
        node_id: impl Into<String>,
        payload: NodePayload,
    ) -> Result<&MessageNode> {
        let node_id = node_id.into();
        if self.nodes.contains_key(&node_id) {
            return Err(TreeError::AlreadyIndexed {
                id: node_id,
                root_id: self.root_id.clone(),
            });
        }
        let parent = self
            .nodes
            .get_mut(parent_id)
            .ok_or_else(|| TreeError::ParentNotFound(parent_id.to_string()))?;
        parent.children_ids.push(node_id.clone());

        let child = MessageNode::new(node_id.clone(), payload, Some(parent_id.to_string()));
        Ok(self.nodes.entry(node_id).or_insert(child))
    }

    /// Move a node to `state`, enforcing the state machine.
    ///
    /// Entering a terminal state stamps `completed_at`. `error_message` is
    /// recorded when given.
    pub fn update_state(
        &mut self,
        node_id: &str,
        state: MessageState,
        error_message: Option<String>,
    ) -> Result<&MessageNode> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;
        if !node.state.can_transition_to(state) {
            return Err(TreeError::InvalidTransition {
                node_id: node_id.to_string(),
                from: node.state,
                to: state,
            });
        }
        node.state = state;
        if state.is_terminal() {
            node.completed_at = Some(Utc::now());
        }
        if error_message.is_some() {
            node.error_message = error_message;
        }
        Ok(node)
    }

    /// Record the agent session a node ran in.
    pub fn set_session_id(&mut self, node_id: &str, session_id: impl Into<String>) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| TreeError::NodeNotFound(node_id.to_string()))?;
        node.session_id = Some(session_id.into());
        Ok(())
    }

    /// Nearest ancestor session id, starting at the node's parent.
    pub fn get_parent_session_id(&self, node_id: &str) -> Option<&str> {
        let mut current = self.nodes.get(node_id)?.parent_id.as_deref();
        // Bounded by tree size so a corrupted parent chain cannot loop.
        for _ in 0..self.nodes.len() {
            let node = self.nodes.get(current?)?;
            if let Some(session) = node.session_id.as_deref() {
                return Some(session);
            }
            current = node.parent_id.as_deref();
        }
        None
    }

    /// Ids of every descendant of `node_id`, breadth-first, excluding itself.
    pub fn descendants(&self, node_id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::from([node_id]);
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            for child in &node.children_ids {
                out.push(child.clone());
                queue.push_back(child);
            }
        }
        out
    }

    /// Serializable copy of the tree.
    pub fn to_snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            root_id: self.root_id.clone(),
            nodes: self.nodes.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }

    /// Rebuild a tree, checking that the snapshot forms one rooted tree.
    pub fn from_snapshot(snapshot: TreeSnapshot) -> Result<Self> {
        let TreeSnapshot { root_id, nodes } = snapshot;
        let invalid = |msg: String| Err(TreeError::InvalidSnapshot(msg));

        let Some(root) = nodes.get(&root_id) else {
            return invalid(format!("root {root_id} missing from nodes"));
        };
        if root.parent_id.is_some() {
            return invalid(format!("root {root_id} has a parent"));
        }
        for (key, node) in &nodes {
            if *key != node.node_id {
                return invalid(format!("node keyed {key} has id {}", node.node_id));
            }
            if *key != root_id && node.parent_id.is_none() {
                return invalid(format!("second root {key}"));
            }
            if let Some(parent_id) = &node.parent_id {
                let Some(parent) = nodes.get(parent_id) else {
                    return invalid(format!("node {key} references missing parent {parent_id}"));
                };
                if !parent.children_ids.contains(key) {
                    return invalid(format!("parent {parent_id} does not list child {key}"));
                }
            }
            for child in &node.children_ids {
                match nodes.get(child) {
                    Some(c) if c.parent_id.as_deref() == Some(key.as_str()) => {}
                    _ => return invalid(format!("node {key} lists bad child {child}")),
                }
            }
        }

        let tree = Self {
            root_id,
            nodes: nodes.into_iter().collect(),
        };
        let mut seen: HashSet<String> = tree.descendants(&tree.root_id).into_iter().collect();
        let _ = seen.insert(tree.root_id.clone());
        if seen.len() != tree.nodes.len() {
            return invalid(format!("{} nodes unreachable from root", tree.nodes.len() - seen.len()));
        }
        Ok(tree)
    }
}

impl From<MessageTree> for TreeSnapshot {
    fn from(tree: MessageTree) -> Self {
        Self {
            root_id: tree.root_id,
            nodes: tree.nodes.into_iter().collect(),
        }
    }
}

impl TryFrom<TreeSnapshot> for MessageTree {
    type Error = TreeError;

    fn try_from(snapshot: TreeSnapshot) -> Result<Self> {
        Self::from_snapshot(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use courier_core::IncomingMessage;

    fn payload(id: &str) -> NodePayload {
        NodePayload::new(
            IncomingMessage::new(format!("text {id}"), "chat", "user", id, "telegram"),
            format!("status-{id}"),
        )
    }

    fn sample() -> MessageTree {
        // A ── B ── D
        // └── C
        let mut tree = MessageTree::new("A", payload("A"));
        let _ = tree.add_child("A", "B", payload("B")).unwrap();
        let _ = tree.add_child("A", "C", payload("C")).unwrap();
        let _ = tree.add_child("B", "D", payload("D")).unwrap();
        tree
    }

    #[test]
    fn add_child_links_both_ways() {
        let tree = sample();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.get_root().children_ids, vec!["B", "C"]);
        assert_eq!(tree.get_node("D").unwrap().parent_id.as_deref(), Some("B"));
        assert_eq!(tree.get_node("D").unwrap().state, MessageState::Pending);
    }

    #[test]
    fn add_child_rejects_missing_parent_and_duplicates() {
        let mut tree = sample();
        assert_matches!(
            tree.add_child("Z", "E", payload("E")),
            Err(TreeError::ParentNotFound(p)) if p == "Z"
        );
        assert_matches!(
            tree.add_child("A", "B", payload("B")),
            Err(TreeError::AlreadyIndexed { .. })
        );
        assert_eq!(tree.get_root().children_ids.len(), 2);
    }

    #[test]
    fn update_state_stamps_completion() {
        let mut tree = sample();
        let _ = tree.update_state("B", MessageState::InProgress, None).unwrap();
        assert!(tree.get_node("B").unwrap().completed_at.is_none());
        let node = tree.update_state("B", MessageState::Completed, None).unwrap();
        assert!(node.completed_at.is_some());
    }

    #[test]
    fn update_state_rejects_illegal_transition() {
        let mut tree = sample();
        assert_matches!(
            tree.update_state("B", MessageState::Completed, None),
            Err(TreeError::InvalidTransition { from: MessageState::Pending, .. })
        );
        let _ = tree.update_state("B", MessageState::Cancelled, None).unwrap();
        assert_matches!(
            tree.update_state("B", MessageState::InProgress, None),
            Err(TreeError::InvalidTransition { .. })
        );
    }

    #[test]
    fn parent_session_walks_ancestors() {
        let mut tree = sample();
        assert_eq!(tree.get_parent_session_id("D"), None);
        tree.set_session_id("A", "sess-root").unwrap();
        assert_eq!(tree.get_parent_session_id("D"), Some("sess-root"));
        tree.set_session_id("B", "sess-b").unwrap();
        assert_eq!(tree.get_parent_session_id("D"), Some("sess-b"));
        // Own session is not considered.
        tree.set_session_id("D", "sess-d").unwrap();
        assert_eq!(tree.get_parent_session_id("D"), Some("sess-b"));
        assert_eq!(tree.get_parent_session_id("A"), None);
    }

    #[test]
    fn descendants_are_breadth_first() {
        let tree = sample();
        assert_eq!(tree.descendants("A"), vec!["B", "C", "D"]);
        assert_eq!(tree.descendants("B"), vec!["D"]);
        assert!(tree.descendants("C").is_empty());
        let ids: Vec<_> = tree.nodes().iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn snapshot_roundtrip_via_serde() {
        let mut tree = sample();
        let _ = tree.update_state("A", MessageState::InProgress, None).unwrap();
        let json = serde_json::to_string(&tree).unwrap();
        let back: MessageTree = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn from_snapshot_rejects_orphans() {
        let mut snap = sample().to_snapshot();
        let d = snap.nodes.get_mut("D").unwrap();
        d.parent_id = Some("missing".into());
        assert_matches!(MessageTree::from_snapshot(snap), Err(TreeError::InvalidSnapshot(_)));
    }

    #[test]
    fn from_snapshot_rejects_second_root() {
        let mut snap = sample().to_snapshot();
        snap.nodes.get_mut("C").unwrap().parent_id = None;
        assert_matches!(MessageTree::from_snapshot(snap), Err(TreeError::InvalidSnapshot(_)));
    }

    #[test]
    fn from_snapshot_rejects_missing_root() {
        let mut snap = sample().to_snapshot();
        snap.root_id = "nope".into();
        assert_matches!(MessageTree::from_snapshot(snap), Err(TreeError::InvalidSnapshot(_)));
    }
}
