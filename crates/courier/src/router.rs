//! Conversation intake.
//!
//! Decides whether an incoming chat message starts a new conversation tree
//! or continues an existing one, picks the first status text shown to the
//! user, and implements the stop command.

use courier_core::{IncomingMessage, NodePayload};
use courier_dispatch::{MessagingPlatform, RateLimitedPlatform};
use courier_tree::{MessageNode, TreeQueueManager};
use tracing::{debug, info, warn};

use crate::errors::Result;

/// Text of a status message after its node was stopped.
pub const STOPPED_TEXT: &str = "⏹ **Stopped.**";

/// Prefixes of the status messages we post ourselves.
const STATUS_PREFIXES: [&str; 11] = ["⏳", "💭", "🔧", "✅", "❌", "🚀", "🤖", "📋", "📊", "🔄", "⏹"];

/// What an incoming text is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intake {
    /// `/stop`: cancel everything.
    Stop,
    /// `/stats`: report load.
    Stats,
    /// One of our own status messages echoed back.
    Echo,
    /// A request for the agent.
    Request,
}

impl Intake {
    /// Classify message text.
    pub fn classify(text: &str) -> Self {
        match text.trim() {
            "/stop" => Self::Stop,
            "/stats" => Self::Stats,
            t if STATUS_PREFIXES.iter().any(|p| t.starts_with(p)) => Self::Echo,
            _ => Self::Request,
        }
    }
}

/// Where a routed message landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Routed {
    /// The new node, PENDING.
    pub node: MessageNode,
    /// Root of its tree.
    pub root_id: String,
    /// Whether a new tree was started.
    pub new_tree: bool,
}

/// Maps chat messages onto conversation trees.
#[derive(Clone, Debug)]
pub struct ConversationRouter {
    manager: TreeQueueManager,
    max_sessions: usize,
}

impl ConversationRouter {
    /// Router over `manager`; `max_sessions` bounds concurrently busy trees
    /// for status reporting.
    pub fn new(manager: TreeQueueManager, max_sessions: usize) -> Self {
        Self {
            manager,
            max_sessions,
        }
    }

    /// The underlying manager.
    pub fn manager(&self) -> &TreeQueueManager {
        &self.manager
    }

    /// Parent node a reply continues, if it replies to something we know.
    fn parent_of(&self, incoming: &IncomingMessage) -> Option<String> {
        let reply_to = incoming.reply_to_message_id.as_deref()?;
        self.manager.resolve_parent_node_id(reply_to)
    }

    /// Status text to post before routing `incoming`.
    pub fn initial_status(&self, incoming: &IncomingMessage) -> String {
        if let Some(parent) = self.parent_of(incoming) {
            if self.manager.is_node_tree_busy(&parent) {
                let position = self.manager.get_queue_size(&parent) + 1;
                return format!("📋 **Queued** (position {position}) - waiting...");
            }
            return "🔄 **Continuing conversation...**".to_string();
        }

        let busy = self.manager.busy_tree_count();
        if busy >= self.max_sessions {
            return format!("⏳ **Waiting for slot...** ({busy}/{})", self.max_sessions);
        }
        "⏳ **Launching new session...**".to_string()
    }

    /// Put `incoming` into a tree and make `status_message_id` resolve to it.
    ///
    /// A reply to a known message or status message becomes a child of the
    /// resolved node; anything else starts a new tree.
    pub fn route(&self, incoming: IncomingMessage, status_message_id: &str) -> Result<Routed> {
        let node_id = incoming.message_id.clone();
        let payload = NodePayload::new(incoming, status_message_id);

        let routed = match self.parent_of(&payload.incoming) {
            Some(parent) => {
                let (tree, node) = self.manager.add_to_tree(&parent, &node_id, payload)?;
                Routed {
                    node,
                    root_id: tree.root_id().to_string(),
                    new_tree: false,
                }
            }
            None => {
                let tree = self.manager.create_tree(&node_id, payload)?;
                Routed {
                    node: tree.get_root().clone(),
                    root_id: tree.root_id().to_string(),
                    new_tree: true,
                }
            }
        };

        self.manager.register_node(status_message_id, &routed.root_id)?;
        debug!(
            node_id = %node_id,
            root_id = %routed.root_id,
            new_tree = routed.new_tree,
            "message routed"
        );
        Ok(routed)
    }

    /// `/stats` reply text.
    pub fn stats_text(&self) -> String {
        format!(
            "📊 **Stats**\n• Active: {}\n• Max: {}\n• Conversations: {}",
            self.manager.busy_tree_count(),
            self.max_sessions,
            self.manager.tree_count()
        )
    }
}

/// `/stop` reply text.
pub fn stop_reply(count: usize) -> String {
    format!("{STOPPED_TEXT} Cancelled {count} pending or active requests.")
}

/// Cancel all work and mark every affected status message as stopped.
///
/// The edits are fire-and-forget through the limiter. Returns the number of
/// cancelled nodes.
pub async fn stop_all<P: MessagingPlatform>(
    manager: &TreeQueueManager,
    platform: &RateLimitedPlatform<P>,
) -> usize {
    let cancelled = manager.cancel_all_sync();
    for node in &cancelled {
        let payload = &node.payload;
        let queued = platform
            .queue_edit_message(
                payload.chat_id(),
                &payload.status_message_id,
                STOPPED_TEXT,
                Some("markdown"),
                true,
            )
            .await;
        if let Err(e) = queued {
            warn!(
                node_id = %node.node_id,
                status_message_id = %payload.status_message_id,
                error = %e,
                "could not queue stopped status"
            );
        }
    }
    info!(cancelled = cancelled.len(), "stopped all conversations");
    cancelled.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use courier_tree::{MessageState, TreeError};

    fn incoming(id: &str) -> IncomingMessage {
        IncomingMessage::new(format!("text {id}"), "chat", "user", id, "telegram")
    }

    #[test]
    fn classify() {
        assert_eq!(Intake::classify("/stop"), Intake::Stop);
        assert_eq!(Intake::classify(" /stats "), Intake::Stats);
        assert_eq!(Intake::classify("✅ **Complete**"), Intake::Echo);
        assert_eq!(Intake::classify("📋 **Queued** (position 2) - waiting..."), Intake::Echo);
        assert_eq!(Intake::classify("fix the build"), Intake::Request);
    }

    #[test]
    fn new_message_starts_tree() {
        let router = ConversationRouter::new(TreeQueueManager::new(), 10);
        assert_eq!(router.initial_status(&incoming("1")), "⏳ **Launching new session...**");
        let routed = router.route(incoming("1"), "s1").unwrap();
        assert!(routed.new_tree);
        assert_eq!(routed.root_id, "1");
        assert_eq!(routed.node.state, MessageState::Pending);
        assert_eq!(router.manager().resolve_parent_node_id("s1").as_deref(), Some("1"));
    }

    #[test]
    fn reply_to_status_message_continues_tree() {
        let router = ConversationRouter::new(TreeQueueManager::new(), 10);
        let _ = router.route(incoming("1"), "s1").unwrap();

        let reply = incoming("2").replying_to("s1");
        assert_eq!(router.initial_status(&reply), "🔄 **Continuing conversation...**");
        let routed = router.route(reply, "s2").unwrap();
        assert!(!routed.new_tree);
        assert_eq!(routed.root_id, "1");
        assert_eq!(routed.node.parent_id.as_deref(), Some("1"));

        // A reply to the second status lands under the second node.
        let routed = router.route(incoming("3").replying_to("s2"), "s3").unwrap();
        assert_eq!(routed.node.parent_id.as_deref(), Some("2"));
    }

    #[test]
    fn reply_to_unknown_message_starts_tree() {
        let router = ConversationRouter::new(TreeQueueManager::new(), 10);
        let routed = router.route(incoming("5").replying_to("999"), "s5").unwrap();
        assert!(routed.new_tree);
    }

    #[test]
    fn duplicate_message_id_is_rejected() {
        let router = ConversationRouter::new(TreeQueueManager::new(), 10);
        let _ = router.route(incoming("1"), "s1").unwrap();
        assert_matches!(
            router.route(incoming("1"), "s1b"),
            Err(crate::errors::AppError::Tree(TreeError::AlreadyIndexed { .. }))
        );
    }

    #[test]
    fn stop_reply_text() {
        assert_eq!(stop_reply(3), "⏹ **Stopped.** Cancelled 3 pending or active requests.");
    }

    #[test]
    fn stats_mentions_limits() {
        let router = ConversationRouter::new(TreeQueueManager::new(), 4);
        let _ = router.route(incoming("1"), "s1").unwrap();
        let text = router.stats_text();
        assert!(text.contains("Active: 0"));
        assert!(text.contains("Max: 4"));
        assert!(text.contains("Conversations: 1"));
    }
}
