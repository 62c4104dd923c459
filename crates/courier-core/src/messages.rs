//! Platform-agnostic message records.
//!
//! Transport adapters convert platform events into [`IncomingMessage`] and
//! turn [`OutgoingMessage`] back into send/edit calls. The conversation core
//! never inspects these beyond passing them through inside [`NodePayload`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message received from a chat platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    /// Message text (empty for voice notes before transcription).
    pub text: String,
    /// Chat the message was posted in.
    pub chat_id: String,
    /// Author of the message.
    pub user_id: String,
    /// Platform-assigned message id.
    pub message_id: String,
    /// Platform name (`"telegram"`, `"discord"`, ...).
    pub platform: String,
    /// Id of the message this one replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
    /// Display name of the author.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// When the message was received.
    pub timestamp: DateTime<Utc>,
    /// Platform file id for voice messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_file_id: Option<String>,
}

impl IncomingMessage {
    /// Create a message with the required fields; optional fields are empty
    /// and the timestamp is now.
    pub fn new(
        text: impl Into<String>,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        message_id: impl Into<String>,
        platform: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            message_id: message_id.into(),
            platform: platform.into(),
            reply_to_message_id: None,
            username: None,
            timestamp: Utc::now(),
            voice_file_id: None,
        }
    }

    /// Mark this message as a reply to `message_id`.
    #[must_use]
    pub fn replying_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to_message_id = Some(message_id.into());
        self
    }

    /// Whether this message replies to another message.
    pub fn is_reply(&self) -> bool {
        self.reply_to_message_id.is_some()
    }
}

/// A message to send, or an edit of one already sent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Message text.
    pub text: String,
    /// Target chat.
    pub chat_id: String,
    /// Message to reply to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Formatting mode understood by the platform (`"markdown"` by default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
    /// When set, edit this message instead of sending a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_message_id: Option<String>,
}

impl OutgoingMessage {
    /// A new markdown message for `chat_id`.
    pub fn new(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            chat_id: chat_id.into(),
            reply_to: None,
            parse_mode: Some("markdown".to_string()),
            edit_message_id: None,
        }
    }

    /// Whether this is an edit of an existing message.
    pub fn is_edit(&self) -> bool {
        self.edit_message_id.is_some()
    }
}

/// Payload carried by each conversation node: the originating request plus
/// the id of the status message posted in reply to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePayload {
    /// The request that created the node.
    pub incoming: IncomingMessage,
    /// Outward-facing status message that is edited as work progresses.
    pub status_message_id: String,
}

impl NodePayload {
    /// Bundle a request with its status message id.
    pub fn new(incoming: IncomingMessage, status_message_id: impl Into<String>) -> Self {
        Self {
            incoming,
            status_message_id: status_message_id.into(),
        }
    }

    /// Chat the node belongs to.
    pub fn chat_id(&self) -> &str {
        &self.incoming.chat_id
    }
}
