//! Room Multiplexer
//!
//! Groups live connections into conversation-scoped broadcast rooms.
//! Each connection registers an outbox sender; room and global broadcast
//! fan out through those queues, which preserves per-connection FIFO
//! delivery order. Delivery is best-effort: a full outbox drops the
//! event rather than blocking the broadcaster.

use std::collections::{HashMap, HashSet};

use shoal_protocol::ServerEvent;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

struct ConnectionEntry {
    user_id: String,
    outbox: mpsc::Sender<ServerEvent>,
}

/// Connection registry plus room membership. Rooms are transient session
/// state keyed by conversation id; nothing here is persisted.
#[derive(Default)]
pub struct RoomMultiplexer {
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    rooms: RwLock<HashMap<String, HashSet<String>>>,
}

impl RoomMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbox. Must be called before the
    /// connection can join rooms or receive global broadcasts.
    pub async fn register_connection(
        &self,
        connection_id: &str,
        user_id: &str,
        outbox: mpsc::Sender<ServerEvent>,
    ) {
        self.connections.write().await.insert(
            connection_id.to_string(),
            ConnectionEntry {
                user_id: user_id.to_string(),
                outbox,
            },
        );
    }

    /// Drop a connection and remove it from every room it joined.
    pub async fn remove_connection(&self, connection_id: &str) {
        self.connections.write().await.remove(connection_id);
        let mut rooms = self.rooms.write().await;
        for members in rooms.values_mut() {
            members.remove(connection_id);
        }
        rooms.retain(|_, members| !members.is_empty());
    }

    /// Subscribe a connection to a room. Idempotent: joining twice leaves
    /// exactly one membership.
    pub async fn join(&self, connection_id: &str, room_id: &str) {
        if !self.connections.read().await.contains_key(connection_id) {
            warn!(conn = %connection_id, room = %room_id, "join from unregistered connection");
            return;
        }
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(conn = %connection_id, room = %room_id, "joined room");
    }

    /// Unsubscribe a connection from a room. Unknown memberships are a
    /// no-op.
    pub async fn leave(&self, connection_id: &str, room_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(room_id) {
            members.remove(connection_id);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    /// Deliver to every connection in the room, including the sender's
    /// own other connections.
    pub async fn broadcast_to_room(&self, room_id: &str, event: ServerEvent) {
        self.broadcast_to_room_except(room_id, None, event).await;
    }

    /// Room broadcast with one connection excluded (typing hints skip the
    /// originating connection).
    pub async fn broadcast_to_room_except(
        &self,
        room_id: &str,
        exclude: Option<&str>,
        event: ServerEvent,
    ) {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room_id) else {
            return;
        };
        let connections = self.connections.read().await;
        for conn_id in members {
            if exclude == Some(conn_id.as_str()) {
                continue;
            }
            if let Some(entry) = connections.get(conn_id) {
                deliver(conn_id, entry, event.clone());
            }
        }
    }

    /// Deliver to every known connection regardless of room membership.
    /// Used for presence transitions and `recipient_id`-tagged fallback
    /// notifications.
    pub async fn broadcast_global(&self, event: ServerEvent) {
        let connections = self.connections.read().await;
        for (conn_id, entry) in connections.iter() {
            deliver(conn_id, entry, event.clone());
        }
    }

    /// Whether the identity has at least one connection joined to the
    /// room. Determines when a notification needs the global fallback.
    pub async fn user_in_room(&self, room_id: &str, user_id: &str) -> bool {
        let rooms = self.rooms.read().await;
        let Some(members) = rooms.get(room_id) else {
            return false;
        };
        let connections = self.connections.read().await;
        members
            .iter()
            .any(|c| connections.get(c).is_some_and(|e| e.user_id == user_id))
    }

    /// Number of connections joined to a room.
    pub async fn room_size(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map_or(0, |m| m.len())
    }
}

fn deliver(conn_id: &str, entry: &ConnectionEntry, event: ServerEvent) {
    if let Err(e) = entry.outbox.try_send(event) {
        // Slow or closed client; the next full fetch self-heals.
        warn!(conn = %conn_id, user = %entry.user_id, "dropping event: {}", e);
    }
}
