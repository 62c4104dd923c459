//! A single message in a conversation tree and its lifecycle states.

use std::fmt;

use chrono::{DateTime, Utc};
use courier_core::NodePayload;
use serde::{Deserialize, Serialize};

/// Processing state of a node.
///
/// ```text
/// pending     ──► in_progress | error | cancelled
/// in_progress ──► completed | error | cancelled
/// ```
///
/// `completed`, `error` and `cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Waiting for its turn in the tree's queue.
    Pending,
    /// Currently handed to a processor.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Failed, or failed before it could start.
    Error,
    /// Stopped by the user.
    Cancelled,
}

impl MessageState {
    /// Whether no further transition is allowed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::InProgress | Self::Error | Self::Cancelled),
            Self::InProgress => matches!(next, Self::Completed | Self::Error | Self::Cancelled),
            Self::Completed | Self::Error | Self::Cancelled => false,
        }
    }

    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for MessageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message within a conversation tree.
///
/// Parent and children are referenced by id; the owning
/// [`MessageTree`](crate::MessageTree) resolves them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    /// Unique id across the whole process.
    pub node_id: String,
    /// Parent id; `None` for the root.
    pub parent_id: Option<String>,
    /// Replies to this node, in the order they were added.
    pub children_ids: Vec<String>,
    /// Lifecycle state.
    pub state: MessageState,
    /// Originating request and status message.
    pub payload: NodePayload,
    /// Agent session id, filled once known.
    pub session_id: Option<String>,
    /// When the node was created.
    pub created_at: DateTime<Utc>,
    /// When the node reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure description for ERROR nodes.
    pub error_message: Option<String>,
}

impl MessageNode {
    /// A fresh PENDING node.
    pub fn new(node_id: impl Into<String>, payload: NodePayload, parent_id: Option<String>) -> Self {
        Self {
            node_id: node_id.into(),
            parent_id,
            children_ids: Vec::new(),
            state: MessageState::Pending,
            payload,
            session_id: None,
            created_at: Utc::now(),
            completed_at: None,
            error_message: None,
        }
    }

    /// Whether this is the root of its tree.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
