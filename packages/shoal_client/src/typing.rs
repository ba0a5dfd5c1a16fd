//! Typing Indicators
//!
//! Client-side bookkeeping for `{conversation, user, active}` typing
//! state. Ephemeral by contract: an indicator expires after 2 s of
//! silence even if the `typing_stop` frame never arrives.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Indicator lifetime after the last typing hint.
pub const TYPING_EXPIRY: Duration = Duration::from_secs(2);

/// Tracks who is typing where. Callers pass `now` explicitly so expiry
/// is deterministic under test.
#[derive(Default)]
pub struct TypingTracker {
    // (conversation_id, user_id) -> last hint
    last_hint: HashMap<(String, String), Instant>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a typing hint, refreshing the expiry window.
    pub fn note_typing(&mut self, conversation_id: &str, user_id: &str, now: Instant) {
        self.last_hint
            .insert((conversation_id.to_string(), user_id.to_string()), now);
    }

    /// Explicit stop: the indicator disappears immediately.
    pub fn note_stop(&mut self, conversation_id: &str, user_id: &str) {
        self.last_hint
            .remove(&(conversation_id.to_string(), user_id.to_string()));
    }

    /// Users with a live indicator in this conversation. Prunes expired
    /// entries as a side effect.
    pub fn active_users(&mut self, conversation_id: &str, now: Instant) -> Vec<String> {
        self.last_hint
            .retain(|_, last| now.duration_since(*last) < TYPING_EXPIRY);
        let mut users: Vec<String> = self
            .last_hint
            .keys()
            .filter(|(conv, _)| conv == conversation_id)
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users
    }

    pub fn is_typing(&mut self, conversation_id: &str, user_id: &str, now: Instant) -> bool {
        self.active_users(conversation_id, now)
            .iter()
            .any(|u| u == user_id)
    }
}
