//! Message Data Model
//!
//! Core records as the synchronization layer sees them. The message body
//! is opaque payload; the sync layer owns only the metadata it merges
//! (`read_by`, `reactions`, and the `created_at` ordering key).

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::ReactionOp;

/// Descriptor for an already-uploaded attachment. Upload and
/// transformation happen elsewhere; the core only carries the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub kind: String,
    pub size: u64,
}

/// One emoji and the set of users currently reacting with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    pub users: HashSet<String>,
}

/// A chat message with its synchronization metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_by: HashSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
}

impl Message {
    pub fn new(conversation_id: &str, sender_id: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: Some(text.to_string()),
            attachments: Vec::new(),
            created_at: Utc::now(),
            read_by: HashSet::new(),
            reactions: Vec::new(),
        }
    }

    /// Add users to `read_by`. The set only grows; re-reads are no-ops.
    /// Returns true if any user was newly added.
    pub fn mark_read_by(&mut self, user_ids: &[String]) -> bool {
        let mut changed = false;
        for id in user_ids {
            changed |= self.read_by.insert(id.clone());
        }
        changed
    }

    /// Whether a two-party "seen" indicator should show for this message:
    /// someone other than the sender has read it.
    pub fn seen_by_peer(&self) -> bool {
        self.read_by.iter().any(|u| u != &self.sender_id)
    }

    /// Apply a reaction mutation, maintaining exclusivity: a user holds at
    /// most one active reaction per message. An `Add` first removes the
    /// user from every other emoji's set; a `Remove` only touches the
    /// named emoji. An emoji whose user set becomes empty is dropped
    /// entirely.
    pub fn apply_reaction(&mut self, emoji: &str, user_id: &str, op: ReactionOp) {
        match op {
            ReactionOp::Add => {
                for r in &mut self.reactions {
                    if r.emoji != emoji {
                        r.users.remove(user_id);
                    }
                }
                match self.reactions.iter_mut().find(|r| r.emoji == emoji) {
                    Some(r) => {
                        r.users.insert(user_id.to_string());
                    }
                    None => {
                        let mut users = HashSet::new();
                        users.insert(user_id.to_string());
                        self.reactions.push(Reaction {
                            emoji: emoji.to_string(),
                            users,
                        });
                    }
                }
            }
            ReactionOp::Remove => {
                if let Some(r) = self.reactions.iter_mut().find(|r| r.emoji == emoji) {
                    r.users.remove(user_id);
                }
            }
        }
        self.reactions.retain(|r| !r.users.is_empty());
    }

    /// The emoji this user is currently reacting with, if any.
    pub fn reaction_of(&self, user_id: &str) -> Option<&str> {
        self.reactions
            .iter()
            .find(|r| r.users.contains(user_id))
            .map(|r| r.emoji.as_str())
    }
}

/// Lightweight per-conversation summary shown in the sidebar. Updated by
/// the write path and by the assistant pipeline; the full message list is
/// only materialized for the active conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPreview {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl ConversationPreview {
    pub fn from_message(msg: &Message) -> Self {
        Self {
            conversation_id: msg.conversation_id.clone(),
            last_message_text: msg.text.clone(),
            last_sender_id: Some(msg.sender_id.clone()),
            last_message_at: Some(msg.created_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message::new("conv-1", "u-1", "hello")
    }

    #[test]
    fn mark_read_by_grows_monotonically() {
        let mut m = msg();
        assert!(m.mark_read_by(&["u-2".into()]));
        // Re-reading is a no-op
        assert!(!m.mark_read_by(&["u-2".into()]));
        assert!(m.mark_read_by(&["u-2".into(), "u-3".into()]));
        assert_eq!(m.read_by.len(), 2);
    }

    #[test]
    fn seen_by_peer_ignores_sender_self_read() {
        let mut m = msg();
        m.mark_read_by(&["u-1".into()]);
        assert!(!m.seen_by_peer());
        m.mark_read_by(&["u-2".into()]);
        assert!(m.seen_by_peer());
    }

    #[test]
    fn reaction_add_is_exclusive_per_user() {
        let mut m = msg();
        m.apply_reaction("👍", "u-2", ReactionOp::Add);
        m.apply_reaction("❤️", "u-2", ReactionOp::Add);

        assert_eq!(m.reaction_of("u-2"), Some("❤️"));
        // 👍 lost its only reactor and was dropped entirely
        assert!(!m.reactions.iter().any(|r| r.emoji == "👍"));
        assert_eq!(m.reactions.len(), 1);
    }

    #[test]
    fn reaction_add_keeps_other_users() {
        let mut m = msg();
        m.apply_reaction("👍", "u-2", ReactionOp::Add);
        m.apply_reaction("👍", "u-3", ReactionOp::Add);
        m.apply_reaction("❤️", "u-2", ReactionOp::Add);

        let thumbs = m.reactions.iter().find(|r| r.emoji == "👍").unwrap();
        assert!(thumbs.users.contains("u-3"));
        assert!(!thumbs.users.contains("u-2"));
        assert_eq!(m.reaction_of("u-2"), Some("❤️"));
    }

    #[test]
    fn removing_last_reaction_drops_entry() {
        let mut m = msg();
        m.apply_reaction("👍", "u-2", ReactionOp::Add);
        m.apply_reaction("👍", "u-2", ReactionOp::Remove);
        assert!(m.reactions.is_empty());
    }

    #[test]
    fn remove_of_absent_reaction_is_noop() {
        let mut m = msg();
        m.apply_reaction("👍", "u-2", ReactionOp::Remove);
        assert!(m.reactions.is_empty());

        m.apply_reaction("👍", "u-2", ReactionOp::Add);
        // Removing a different emoji leaves the existing one alone
        m.apply_reaction("❤️", "u-2", ReactionOp::Remove);
        assert_eq!(m.reaction_of("u-2"), Some("👍"));
    }

    #[test]
    fn reaction_exclusivity_over_arbitrary_sequence() {
        let mut m = msg();
        let ops = [
            ("👍", ReactionOp::Add),
            ("❤️", ReactionOp::Add),
            ("😂", ReactionOp::Add),
            ("❤️", ReactionOp::Remove),
            ("😂", ReactionOp::Remove),
            ("👍", ReactionOp::Add),
        ];
        for (emoji, op) in ops {
            m.apply_reaction(emoji, "u-2", op);
            let holding: Vec<_> = m
                .reactions
                .iter()
                .filter(|r| r.users.contains("u-2"))
                .collect();
            assert!(holding.len() <= 1, "user held {} reactions", holding.len());
        }
        assert_eq!(m.reaction_of("u-2"), Some("👍"));
    }

    #[test]
    fn preview_from_message() {
        let m = msg();
        let p = ConversationPreview::from_message(&m);
        assert_eq!(p.conversation_id, "conv-1");
        assert_eq!(p.last_message_text.as_deref(), Some("hello"));
        assert_eq!(p.last_sender_id.as_deref(), Some("u-1"));
        assert_eq!(p.last_message_at, Some(m.created_at));
    }

    #[test]
    fn message_serde_roundtrip_preserves_metadata() {
        let mut m = msg();
        m.mark_read_by(&["u-2".into()]);
        m.apply_reaction("👍", "u-2", ReactionOp::Add);

        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn message_without_text_skips_field() {
        let mut m = msg();
        m.text = None;
        m.attachments.push(Attachment {
            url: "https://files.example/a.png".into(),
            kind: "image/png".into(),
            size: 1024,
        });
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("\"text\""));
        assert!(json.contains("a.png"));
    }
}
