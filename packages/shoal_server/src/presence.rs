//! Presence Registry
//!
//! Bidirectional map between user identities and their live connections.
//! In-memory only; a process restart drops all presence and clients
//! re-announce on reconnect.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::debug;

/// Result of a register/unregister call: whether the identity crossed
/// the offline/online boundary. Transitions trigger a global
/// `presence_changed` broadcast; non-transitions (second tab) do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    CameOnline,
    WentOffline,
    NoChange,
}

/// Identity ↔ connection-set registry. An identity is online while it
/// holds at least one connection.
#[derive(Default)]
pub struct PresenceRegistry {
    connections: RwLock<HashMap<String, HashSet<String>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for an identity. A second connection from
    /// the same identity (multi-tab) is tracked but is not a fresh login.
    pub async fn register(&self, user_id: &str, connection_id: &str) -> PresenceTransition {
        let mut map = self.connections.write().await;
        let conns = map.entry(user_id.to_string()).or_default();
        let was_offline = conns.is_empty();
        conns.insert(connection_id.to_string());
        if was_offline {
            debug!(user = %user_id, conn = %connection_id, "user came online");
            PresenceTransition::CameOnline
        } else {
            PresenceTransition::NoChange
        }
    }

    /// Remove exactly one connection. The identity goes offline only when
    /// its last connection is gone. Unknown connections are a no-op.
    pub async fn unregister(&self, user_id: &str, connection_id: &str) -> PresenceTransition {
        let mut map = self.connections.write().await;
        let Some(conns) = map.get_mut(user_id) else {
            return PresenceTransition::NoChange;
        };
        if !conns.remove(connection_id) {
            return PresenceTransition::NoChange;
        }
        if conns.is_empty() {
            map.remove(user_id);
            debug!(user = %user_id, conn = %connection_id, "user went offline");
            PresenceTransition::WentOffline
        } else {
            PresenceTransition::NoChange
        }
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(user_id)
            .is_some_and(|c| !c.is_empty())
    }

    /// All identities currently holding at least one connection.
    pub async fn snapshot(&self) -> HashSet<String> {
        self.connections.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_first_connection_is_transition() {
        let reg = PresenceRegistry::new();
        assert_eq!(
            reg.register("u-1", "conn-1").await,
            PresenceTransition::CameOnline
        );
        assert!(reg.is_online("u-1").await);
    }

    #[tokio::test]
    async fn second_tab_is_not_a_fresh_login() {
        let reg = PresenceRegistry::new();
        reg.register("u-1", "conn-1").await;
        assert_eq!(
            reg.register("u-1", "conn-2").await,
            PresenceTransition::NoChange
        );
    }

    #[tokio::test]
    async fn offline_only_after_last_connection_drops() {
        let reg = PresenceRegistry::new();
        reg.register("u-1", "conn-1").await;
        reg.register("u-1", "conn-2").await;

        assert_eq!(
            reg.unregister("u-1", "conn-1").await,
            PresenceTransition::NoChange
        );
        assert!(reg.is_online("u-1").await);

        assert_eq!(
            reg.unregister("u-1", "conn-2").await,
            PresenceTransition::WentOffline
        );
        assert!(!reg.is_online("u-1").await);
    }

    #[tokio::test]
    async fn unregister_unknown_connection_is_noop() {
        let reg = PresenceRegistry::new();
        assert_eq!(
            reg.unregister("u-1", "conn-x").await,
            PresenceTransition::NoChange
        );

        reg.register("u-1", "conn-1").await;
        assert_eq!(
            reg.unregister("u-1", "conn-x").await,
            PresenceTransition::NoChange
        );
        assert!(reg.is_online("u-1").await);
    }

    #[tokio::test]
    async fn snapshot_lists_online_identities() {
        let reg = PresenceRegistry::new();
        reg.register("u-1", "conn-1").await;
        reg.register("u-2", "conn-2").await;
        reg.register("u-2", "conn-3").await;

        let snap = reg.snapshot().await;
        assert_eq!(snap.len(), 2);
        assert!(snap.contains("u-1"));
        assert!(snap.contains("u-2"));

        reg.unregister("u-1", "conn-1").await;
        assert!(!reg.snapshot().await.contains("u-1"));
    }

    #[tokio::test]
    async fn presence_accuracy_over_register_sequences() {
        // is_online(id) holds iff the registered-connection count is > 0,
        // across an arbitrary interleaving.
        let reg = PresenceRegistry::new();
        let ops: &[(&str, &str, bool)] = &[
            ("u-1", "c1", true),
            ("u-1", "c2", true),
            ("u-1", "c1", false),
            ("u-1", "c1", false), // double-unregister
            ("u-1", "c2", false),
            ("u-1", "c3", true),
        ];
        let mut live: HashSet<&str> = HashSet::new();
        for (user, conn, add) in ops {
            if *add {
                reg.register(user, conn).await;
                live.insert(conn);
            } else {
                reg.unregister(user, conn).await;
                live.remove(conn);
            }
            assert_eq!(reg.is_online(user).await, !live.is_empty());
        }
    }
}
