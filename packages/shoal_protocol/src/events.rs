//! Wire Event Vocabulary
//!
//! The closed set of typed events exchanged over the duplex channel.
//! Frames are JSON with a `type` tag; anything that fails to decode is
//! rejected at the channel boundary rather than passed through.

use serde::{Deserialize, Serialize};

use crate::model::Message;

/// Reaction mutation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionOp {
    Add,
    Remove,
}

/// Group membership mutation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipOp {
    Add,
    Remove,
}

/// Frames sent from a client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Subscribe this connection to a conversation room.
    JoinRoom { room_id: String },
    /// Unsubscribe from a conversation room (chat window closed).
    LeaveRoom { room_id: String },
    /// Ephemeral typing hint, relayed to the room excluding the sender.
    Typing { conversation_id: String },
    TypingStop { conversation_id: String },
}

/// Frames sent from the server to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// New message delivered live into its conversation room.
    MessageNew {
        conversation_id: String,
        message: Message,
    },
    /// Peer is typing in a conversation (sender excluded from fan-out).
    Typing {
        conversation_id: String,
        user_id: String,
    },
    TypingStop {
        conversation_id: String,
        user_id: String,
    },
    /// An identity crossed the offline/online boundary. Global delivery:
    /// any peer's UI may display this status.
    PresenceChanged { user_id: String, online: bool },
    /// Reaction mutation on a message, applied in place by receivers.
    ReactionChanged {
        message_id: String,
        conversation_id: String,
        emoji: String,
        user_id: String,
        op: ReactionOp,
    },
    /// Bulk read-state update for one reader in one conversation.
    ReadReceiptBatch {
        conversation_id: String,
        user_id: String,
        message_ids: Vec<String>,
    },
    /// Group membership changed, with the rendered system message.
    /// Delivered to the room, and additionally as a `recipient_id`-tagged
    /// global fallback for members who never joined the room.
    MembershipChanged {
        group_id: String,
        op: MembershipOp,
        system_message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient_id: Option<String>,
    },
    /// An entity (group, conversation) was deleted. Always carries the
    /// recipient so clients filter before acting.
    EntityRemoved {
        entity_id: String,
        recipient_id: String,
    },
}

impl ServerEvent {
    /// The recipient filter tag, if this event is a targeted fallback.
    /// Clients must ignore tagged events addressed to someone else.
    pub fn recipient_id(&self) -> Option<&str> {
        match self {
            ServerEvent::MembershipChanged { recipient_id, .. } => recipient_id.as_deref(),
            ServerEvent::EntityRemoved { recipient_id, .. } => Some(recipient_id),
            _ => None,
        }
    }
}

/// Decode an incoming client frame. Returns None on malformed or
/// out-of-vocabulary input; callers log and drop.
pub fn decode_client_event(text: &str) -> Option<ClientEvent> {
    serde_json::from_str(text).ok()
}
