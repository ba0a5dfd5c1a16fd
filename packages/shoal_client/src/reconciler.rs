//! Client State Reconciler
//!
//! Merges the three message sources a client sees — authoritative
//! fetches, its own optimistic sends, and live events — into one
//! consistent view: a full timeline for the active conversation plus a
//! preview/unread side index for everything else. Optimistic sends go
//! through an explicit two-phase commit (temp id on insert, real id on
//! ack) so the ack and the live echo can arrive in either order without
//! duplicating the message.
//!
//! Nothing here returns an error: stale or unmatched events are dropped,
//! at most logged. A missed update is self-healed by the next fetch.

use std::collections::{HashMap, HashSet};

use tracing::debug;
use uuid::Uuid;

use shoal_protocol::{ConversationPreview, MembershipOp, Message, ReactionOp, ServerEvent};

/// Two-phase commit state of one optimistic send, keyed by temp id.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SendState {
    /// Inserted locally, no server ack yet.
    Pending,
    /// Acked; holds the server-assigned id.
    Committed(String),
}

/// What the caller should do after applying one event. The reconciler
/// decides merge semantics; the caller decides rendering/notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The active conversation's timeline changed; re-render it.
    ActiveTimelineChanged,
    /// An inactive conversation's side index changed. `notify` is false
    /// for the client's own echoes.
    BackgroundUpdated {
        conversation_id: String,
        notify: bool,
    },
    /// A peer crossed the offline/online boundary.
    PresenceChanged { user_id: String, online: bool },
    /// Group membership changed; `system_message` is display-ready.
    SystemNotice {
        conversation_id: String,
        system_message: String,
    },
    /// A conversation this client belonged to was deleted; all local
    /// state for it is already gone.
    ConversationRemoved { conversation_id: String },
    /// Nothing to do (duplicate, stale, or not addressed to us).
    None,
}

/// Per-identity reconciler. One instance per logged-in client.
pub struct Reconciler {
    self_id: String,
    active_conversation: Option<String>,
    timeline: Vec<Message>,
    sends: HashMap<String, SendState>,
    /// Real ids from acked sends, for deduplicating the late echo.
    committed_ids: HashSet<String>,
    previews: HashMap<String, ConversationPreview>,
    unread: HashMap<String, u32>,
}

impl Reconciler {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            active_conversation: None,
            timeline: Vec::new(),
            sends: HashMap::new(),
            committed_ids: HashSet::new(),
            previews: HashMap::new(),
            unread: HashMap::new(),
        }
    }

    /// Open a conversation with its freshly fetched timeline. The fetch
    /// wholesale-replaces local state and clears the unread counter.
    /// Returns the ids of peer messages not yet read by this client, for
    /// the caller to acknowledge in one read-receipt batch.
    pub fn open_conversation(
        &mut self,
        conversation_id: &str,
        fetched: Vec<Message>,
    ) -> Vec<String> {
        let unacked: Vec<String> = fetched
            .iter()
            .filter(|m| m.sender_id != self.self_id && !m.read_by.contains(&self.self_id))
            .map(|m| m.id.clone())
            .collect();

        self.active_conversation = Some(conversation_id.to_string());
        self.timeline = fetched;
        self.unread.remove(conversation_id);
        self.prune_settled_sends();
        unacked
    }

    /// Close the active conversation (chat window closed). The side index
    /// keeps tracking it.
    pub fn close_conversation(&mut self) {
        self.active_conversation = None;
        self.timeline.clear();
        self.prune_settled_sends();
    }

    /// Drop bookkeeping for settled sends. Both call sites coincide with
    /// a wholesale fetch, after which the timeline itself is the dedup
    /// authority; only in-flight sends still need their temp ids.
    fn prune_settled_sends(&mut self) {
        self.sends
            .retain(|_, state| matches!(state, SendState::Pending));
        self.committed_ids.clear();
    }

    /// Insert an optimistic message for an outgoing send and return it.
    /// The temp id is replaced by the server-assigned message on ack.
    pub fn send_optimistic(&mut self, text: &str) -> Option<Message> {
        let conversation_id = self.active_conversation.clone()?;
        let mut message = Message::new(&conversation_id, &self.self_id, text);
        message.id = format!("temp-{}", Uuid::new_v4());

        self.sends.insert(message.id.clone(), SendState::Pending);
        self.previews.insert(
            conversation_id,
            ConversationPreview::from_message(&message),
        );
        self.timeline.push(message.clone());
        Some(message)
    }

    /// Server acked a send: swap the temp message for the real one and
    /// remember the real id so the live echo deduplicates. When the echo
    /// won the race and is already in the timeline, the temp entry is
    /// dropped instead, so each send transitions exactly once.
    pub fn commit_send(&mut self, temp_id: &str, real: Message) {
        self.committed_ids.insert(real.id.clone());
        self.sends
            .insert(temp_id.to_string(), SendState::Committed(real.id.clone()));

        let echo_arrived = self.timeline.iter().any(|m| m.id == real.id);
        if let Some(pos) = self.timeline.iter().position(|m| m.id == temp_id) {
            if echo_arrived {
                self.timeline.remove(pos);
            } else {
                self.timeline[pos] = real;
                self.resort_timeline();
            }
        }
    }

    /// The send failed: remove the optimistic message. No error surfaces
    /// to the timeline; the composer retains the draft.
    pub fn rollback_send(&mut self, temp_id: &str) {
        self.sends.remove(temp_id);
        if let Some(pos) = self.timeline.iter().position(|m| m.id == temp_id) {
            self.timeline.remove(pos);
        }
    }

    /// Merge one live event. Infallible; anything stale or foreign comes
    /// back as `Effect::None`.
    pub fn apply_event(&mut self, event: ServerEvent) -> Effect {
        if let Some(recipient) = event.recipient_id() {
            if recipient != self.self_id {
                return Effect::None;
            }
        }

        match event {
            ServerEvent::MessageNew {
                conversation_id,
                message,
            } => self.apply_message_new(conversation_id, message),
            ServerEvent::ReactionChanged {
                message_id,
                emoji,
                user_id,
                op,
                ..
            } => self.apply_reaction(&message_id, &emoji, &user_id, op),
            ServerEvent::ReadReceiptBatch {
                user_id,
                message_ids,
                ..
            } => self.apply_read_receipts(&user_id, &message_ids),
            ServerEvent::PresenceChanged { user_id, online } => {
                Effect::PresenceChanged { user_id, online }
            }
            ServerEvent::MembershipChanged {
                group_id,
                system_message,
                ..
            } => Effect::SystemNotice {
                conversation_id: group_id,
                system_message,
            },
            ServerEvent::EntityRemoved { entity_id, .. } => self.remove_conversation(&entity_id),
            // Typing hints belong to the TypingTracker, not the timeline
            ServerEvent::Typing { .. } | ServerEvent::TypingStop { .. } => Effect::None,
        }
    }

    fn apply_message_new(&mut self, conversation_id: String, message: Message) -> Effect {
        let own = message.sender_id == self.self_id;

        if self.active_conversation.as_deref() != Some(conversation_id.as_str()) {
            // Side index only: the full timeline is fetched on open.
            self.previews.insert(
                conversation_id.clone(),
                ConversationPreview::from_message(&message),
            );
            if !own {
                *self.unread.entry(conversation_id.clone()).or_insert(0) += 1;
            }
            return Effect::BackgroundUpdated {
                conversation_id,
                notify: !own,
            };
        }

        // Echo of an acked send: already swapped in by commit_send.
        if self.committed_ids.contains(&message.id) {
            return Effect::None;
        }
        if self.timeline.iter().any(|m| m.id == message.id) {
            return Effect::None;
        }

        // An own echo racing ahead of its ack is appended like any live
        // message; the ack drops the temp entry when it lands. Guessing
        // which pending send an echo belongs to is unsound with more
        // than one in flight.
        self.previews.insert(
            conversation_id,
            ConversationPreview::from_message(&message),
        );
        self.timeline.push(message);
        self.resort_timeline();
        Effect::ActiveTimelineChanged
    }

    fn apply_reaction(
        &mut self,
        message_id: &str,
        emoji: &str,
        user_id: &str,
        op: ReactionOp,
    ) -> Effect {
        match self.timeline.iter_mut().find(|m| m.id == message_id) {
            Some(message) => {
                message.apply_reaction(emoji, user_id, op);
                Effect::ActiveTimelineChanged
            }
            None => {
                debug!(message = %message_id, "reaction for message not in view, dropped");
                Effect::None
            }
        }
    }

    fn apply_read_receipts(&mut self, user_id: &str, message_ids: &[String]) -> Effect {
        let mut changed = false;
        for message in &mut self.timeline {
            if message_ids.contains(&message.id) {
                changed |= message.mark_read_by(std::slice::from_ref(&user_id.to_string()));
            }
        }
        if changed {
            Effect::ActiveTimelineChanged
        } else {
            Effect::None
        }
    }

    fn remove_conversation(&mut self, conversation_id: &str) -> Effect {
        self.previews.remove(conversation_id);
        self.unread.remove(conversation_id);
        if self.active_conversation.as_deref() == Some(conversation_id) {
            self.active_conversation = None;
            self.timeline.clear();
        }
        Effect::ConversationRemoved {
            conversation_id: conversation_id.to_string(),
        }
    }

    fn resort_timeline(&mut self) {
        self.timeline
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    }

    pub fn timeline(&self) -> &[Message] {
        &self.timeline
    }

    pub fn active_conversation(&self) -> Option<&str> {
        self.active_conversation.as_deref()
    }

    pub fn preview(&self, conversation_id: &str) -> Option<&ConversationPreview> {
        self.previews.get(conversation_id)
    }

    pub fn unread_count(&self, conversation_id: &str) -> u32 {
        self.unread.get(conversation_id).copied().unwrap_or(0)
    }

    /// The server-assigned id for an acked send, keyed by its temp id.
    pub fn real_id_of(&self, temp_id: &str) -> Option<&str> {
        match self.sends.get(temp_id) {
            Some(SendState::Committed(real)) => Some(real.as_str()),
            _ => None,
        }
    }

    /// Render a membership system message the way the server does, for
    /// local-echo display before the event round-trips.
    pub fn render_membership_notice(actor: &str, member: &str, op: MembershipOp) -> String {
        match op {
            MembershipOp::Add => format!("{} added {}", actor, member),
            MembershipOp::Remove => format!("{} removed {}", actor, member),
        }
    }
}
