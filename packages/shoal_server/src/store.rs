//! Durable-store Boundary
//!
//! The core only needs key-based CRUD on messages and conversation
//! previews plus atomic set mutations for read receipts and reactions.
//! Any document or relational store exposing these primitives can sit
//! behind the trait; `MemoryStore` is the process-local implementation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use shoal_protocol::{ConversationPreview, Message, ReactionOp};

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(&self, msg: &Message) -> Result<()>;

    async fn get_message(&self, id: &str) -> Result<Option<Message>>;

    /// Full timeline for a conversation, ordered oldest-first by
    /// `created_at`.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn delete_message(&self, id: &str) -> Result<bool>;

    /// Atomic "add value to set field": mark a batch of messages read by
    /// one user. Unknown ids are skipped. Returns the ids actually
    /// changed.
    async fn add_read_by(&self, message_ids: &[String], user_id: &str) -> Result<Vec<String>>;

    /// Atomic reaction mutation honoring per-user exclusivity. Returns
    /// the updated message, or None if the id is unknown.
    async fn apply_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
        op: ReactionOp,
    ) -> Result<Option<Message>>;

    async fn upsert_preview(&self, preview: &ConversationPreview) -> Result<()>;

    async fn get_preview(&self, conversation_id: &str) -> Result<Option<ConversationPreview>>;

    /// Messages from one sender in one conversation at or after `since`.
    /// The reply pipeline recomputes its daily rate counter from this.
    async fn count_messages_from_sender_since(
        &self,
        conversation_id: &str,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64>;

    /// Remove a conversation's messages and preview (group deleted).
    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;
}

/// In-memory store. Process-local by design: the spec scopes real
/// persistence out, and clients refetch after a restart anyway.
#[derive(Default)]
pub struct MemoryStore {
    messages: RwLock<HashMap<String, Message>>,
    previews: RwLock<HashMap<String, ConversationPreview>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, msg: &Message) -> Result<()> {
        self.messages
            .write()
            .await
            .insert(msg.id.clone(), msg.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let mut msgs: Vec<Message> = self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        msgs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(msgs)
    }

    async fn delete_message(&self, id: &str) -> Result<bool> {
        Ok(self.messages.write().await.remove(id).is_some())
    }

    async fn add_read_by(&self, message_ids: &[String], user_id: &str) -> Result<Vec<String>> {
        let mut messages = self.messages.write().await;
        let mut changed = Vec::new();
        for id in message_ids {
            if let Some(msg) = messages.get_mut(id) {
                if msg.mark_read_by(std::slice::from_ref(&user_id.to_string())) {
                    changed.push(id.clone());
                }
            }
        }
        Ok(changed)
    }

    async fn apply_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
        op: ReactionOp,
    ) -> Result<Option<Message>> {
        let mut messages = self.messages.write().await;
        Ok(messages.get_mut(message_id).map(|msg| {
            msg.apply_reaction(emoji, user_id, op);
            msg.clone()
        }))
    }

    async fn upsert_preview(&self, preview: &ConversationPreview) -> Result<()> {
        self.previews
            .write()
            .await
            .insert(preview.conversation_id.clone(), preview.clone());
        Ok(())
    }

    async fn get_preview(&self, conversation_id: &str) -> Result<Option<ConversationPreview>> {
        Ok(self.previews.read().await.get(conversation_id).cloned())
    }

    async fn count_messages_from_sender_since(
        &self,
        conversation_id: &str,
        sender_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .filter(|m| {
                m.conversation_id == conversation_id
                    && m.sender_id == sender_id
                    && m.created_at >= since
            })
            .count() as u64)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        self.messages
            .write()
            .await
            .retain(|_, m| m.conversation_id != conversation_id);
        self.previews.write().await.remove(conversation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_msg(conv: &str, sender: &str, text: &str) -> Message {
        Message::new(conv, sender, text)
    }

    #[tokio::test]
    async fn insert_and_get_by_id() {
        let store = MemoryStore::new();
        let msg = make_msg("conv-1", "u-1", "hello");
        store.insert_message(&msg).await.unwrap();

        let fetched = store.get_message(&msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.text.as_deref(), Some("hello"));
        assert!(store.get_message("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_messages_oldest_first() {
        let store = MemoryStore::new();
        let mut first = make_msg("conv-1", "u-1", "first");
        let mut second = make_msg("conv-1", "u-1", "second");
        first.created_at = Utc::now() - Duration::seconds(10);
        second.created_at = Utc::now();
        // Insert newest first to prove ordering comes from created_at
        store.insert_message(&second).await.unwrap();
        store.insert_message(&first).await.unwrap();
        store
            .insert_message(&make_msg("conv-2", "u-1", "other"))
            .await
            .unwrap();

        let msgs = store.list_messages("conv-1").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].text.as_deref(), Some("first"));
        assert_eq!(msgs[1].text.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn add_read_by_skips_unknown_and_reports_changes() {
        let store = MemoryStore::new();
        let msg = make_msg("conv-1", "u-1", "hello");
        store.insert_message(&msg).await.unwrap();

        let changed = store
            .add_read_by(&[msg.id.clone(), "ghost".to_string()], "u-2")
            .await
            .unwrap();
        assert_eq!(changed, vec![msg.id.clone()]);

        // Second read of the same batch changes nothing
        let changed = store.add_read_by(&[msg.id.clone()], "u-2").await.unwrap();
        assert!(changed.is_empty());

        let fetched = store.get_message(&msg.id).await.unwrap().unwrap();
        assert!(fetched.read_by.contains("u-2"));
    }

    #[tokio::test]
    async fn apply_reaction_switches_emoji() {
        let store = MemoryStore::new();
        let msg = make_msg("conv-1", "u-1", "hello");
        store.insert_message(&msg).await.unwrap();

        store
            .apply_reaction(&msg.id, "👍", "u-2", ReactionOp::Add)
            .await
            .unwrap();
        let updated = store
            .apply_reaction(&msg.id, "❤️", "u-2", ReactionOp::Add)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.reaction_of("u-2"), Some("❤️"));
        assert_eq!(updated.reactions.len(), 1);

        assert!(
            store
                .apply_reaction("ghost", "👍", "u-2", ReactionOp::Add)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn preview_upsert_replaces() {
        let store = MemoryStore::new();
        let msg = make_msg("conv-1", "u-1", "first");
        store
            .upsert_preview(&ConversationPreview::from_message(&msg))
            .await
            .unwrap();
        let newer = make_msg("conv-1", "u-2", "second");
        store
            .upsert_preview(&ConversationPreview::from_message(&newer))
            .await
            .unwrap();

        let p = store.get_preview("conv-1").await.unwrap().unwrap();
        assert_eq!(p.last_message_text.as_deref(), Some("second"));
        assert_eq!(p.last_sender_id.as_deref(), Some("u-2"));
    }

    #[tokio::test]
    async fn count_messages_from_sender_since() {
        let store = MemoryStore::new();
        let today = Utc::now();
        let midnight = today
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();

        let mut yesterday = make_msg("conv-1", "bot", "old");
        yesterday.created_at = midnight - Duration::hours(2);
        store.insert_message(&yesterday).await.unwrap();
        for i in 0..3 {
            let mut m = make_msg("conv-1", "bot", &format!("r{}", i));
            m.created_at = midnight + Duration::minutes(i);
            store.insert_message(&m).await.unwrap();
        }
        store
            .insert_message(&make_msg("conv-1", "u-1", "not the bot"))
            .await
            .unwrap();

        let count = store
            .count_messages_from_sender_since("conv-1", "bot", midnight)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn delete_conversation_clears_messages_and_preview() {
        let store = MemoryStore::new();
        let msg = make_msg("conv-1", "u-1", "bye");
        store.insert_message(&msg).await.unwrap();
        store
            .upsert_preview(&ConversationPreview::from_message(&msg))
            .await
            .unwrap();
        store
            .insert_message(&make_msg("conv-2", "u-1", "stays"))
            .await
            .unwrap();

        store.delete_conversation("conv-1").await.unwrap();
        assert!(store.list_messages("conv-1").await.unwrap().is_empty());
        assert!(store.get_preview("conv-1").await.unwrap().is_none());
        assert_eq!(store.list_messages("conv-2").await.unwrap().len(), 1);
    }
}
