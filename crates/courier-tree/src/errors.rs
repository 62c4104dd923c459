//! Tree and queue error types.

use courier_core::{Categorize, ErrorCategory};
use thiserror::Error;

use crate::node::MessageState;

/// Errors from tree construction, state updates and snapshot restore.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TreeError {
    /// The parent id is not indexed in any tree.
    #[error("parent not found: {0}")]
    ParentNotFound(String),
    /// No node with this id exists.
    #[error("node not found: {0}")]
    NodeNotFound(String),
    /// No tree with this root id exists.
    #[error("tree not found: {0}")]
    TreeNotFound(String),
    /// The id is already owned by a tree.
    #[error("id {id} already belongs to tree {root_id}")]
    AlreadyIndexed {
        /// The conflicting id.
        id: String,
        /// Root of the tree that owns it.
        root_id: String,
    },
    /// The state machine forbids this transition.
    #[error("invalid transition for node {node_id}: {from} -> {to}")]
    InvalidTransition {
        /// Node being updated.
        node_id: String,
        /// Current state.
        from: MessageState,
        /// Requested state.
        to: MessageState,
    },
    /// A snapshot is structurally inconsistent.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Categorize for TreeError {
    fn category(&self) -> ErrorCategory {
        match self {
            Self::ParentNotFound(_)
            | Self::NodeNotFound(_)
            | Self::TreeNotFound(_)
            | Self::AlreadyIndexed { .. } => ErrorCategory::Caller,
            Self::InvalidTransition { .. } => ErrorCategory::State,
            Self::InvalidSnapshot(_) => ErrorCategory::Persistence,
        }
    }
}

/// Result type for tree operations.
pub type Result<T> = std::result::Result<T, TreeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(TreeError::ParentNotFound("p1".into()).to_string(), "parent not found: p1");
        let err = TreeError::InvalidTransition {
            node_id: "n1".into(),
            from: MessageState::Completed,
            to: MessageState::InProgress,
        };
        assert_eq!(err.to_string(), "invalid transition for node n1: completed -> in_progress");
    }

    #[test]
    fn categories() {
        assert_eq!(TreeError::NodeNotFound("x".into()).category(), ErrorCategory::Caller);
        assert_eq!(TreeError::InvalidSnapshot("x".into()).category(), ErrorCategory::Persistence);
        assert!(!TreeError::ParentNotFound("x".into()).is_retryable());
    }
}
