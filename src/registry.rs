use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;
use uuid::Uuid;

pub type ConnectionId = Uuid;

struct Connection {
    /// Set once the connection authenticates; a connection with no binding
    /// can hold no room memberships.
    principal_id: Option<String>,
    rooms: HashSet<String>,
    tx: UnboundedSender<String>,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    /// A principal may hold several live connections (multiple tabs).
    principals: HashMap<String, HashSet<ConnectionId>>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Process-local map of live socket connections, their principal bindings
/// and room memberships. Constructed at process start, torn down with the
/// process; the realtime gateway is its only writer.
///
/// Locks are scoped and never held across an await; outbound delivery goes
/// over unbounded channels so sending under the lock never blocks.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted connection. No principal is bound yet.
    pub fn register(&self, tx: UnboundedSender<String>) -> ConnectionId {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock().unwrap();
        inner.connections.insert(
            id,
            Connection {
                principal_id: None,
                rooms: HashSet::new(),
                tx,
            },
        );
        id
    }

    /// Bind the connection to a principal. Re-authentication rebinds.
    pub fn authenticate(&self, conn: ConnectionId, principal_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(connection) = inner.connections.get_mut(&conn) else {
            return;
        };
        let previous = connection.principal_id.replace(principal_id.to_string());

        if let Some(prev) = previous {
            if let Some(set) = inner.principals.get_mut(&prev) {
                set.remove(&conn);
                if set.is_empty() {
                    inner.principals.remove(&prev);
                }
            }
        }
        inner
            .principals
            .entry(principal_id.to_string())
            .or_default()
            .insert(conn);
    }

    pub fn principal_of(&self, conn: ConnectionId) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .connections
            .get(&conn)
            .and_then(|c| c.principal_id.clone())
    }

    /// Idempotent room join. Returns false for an unknown connection.
    pub fn join_room(&self, conn: ConnectionId, chat_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(connection) = inner.connections.get_mut(&conn) else {
            return false;
        };
        connection.rooms.insert(chat_id.to_string());
        inner.rooms.entry(chat_id.to_string()).or_default().insert(conn);
        true
    }

    /// Idempotent room leave.
    pub fn leave_room(&self, conn: ConnectionId, chat_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(connection) = inner.connections.get_mut(&conn) {
            connection.rooms.remove(chat_id);
        }
        if let Some(members) = inner.rooms.get_mut(chat_id) {
            members.remove(&conn);
            if members.is_empty() {
                inner.rooms.remove(chat_id);
            }
        }
    }

    /// Drop the connection from the registry and every room it joined.
    pub fn remove(&self, conn: ConnectionId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(connection) = inner.connections.remove(&conn) else {
            return;
        };
        if let Some(principal_id) = connection.principal_id {
            if let Some(set) = inner.principals.get_mut(&principal_id) {
                set.remove(&conn);
                if set.is_empty() {
                    inner.principals.remove(&principal_id);
                }
            }
        }
        for room in connection.rooms {
            if let Some(members) = inner.rooms.get_mut(&room) {
                members.remove(&conn);
                if members.is_empty() {
                    inner.rooms.remove(&room);
                }
            }
        }
    }

    /// Deliver a payload to every connection currently in the room,
    /// including the sender's own other connections. Dead connections are
    /// skipped; their cleanup happens on disconnect. Returns the number of
    /// connections the payload was handed to.
    pub fn send_to_room(&self, chat_id: &str, payload: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        let Some(members) = inner.rooms.get(chat_id) else {
            return 0;
        };

        let mut delivered = 0;
        for conn in members {
            if let Some(connection) = inner.connections.get(conn) {
                match connection.tx.send(payload.to_string()) {
                    Ok(()) => delivered += 1,
                    Err(_) => {
                        warn!(connection = %conn, chat_id, "dropping event for dead connection");
                    }
                }
            }
        }
        delivered
    }

    /// Send a payload to one connection. Used for protocol replies.
    pub fn send_to_connection(&self, conn: ConnectionId, payload: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some(connection) = inner.connections.get(&conn) {
            if connection.tx.send(payload.to_string()).is_err() {
                warn!(connection = %conn, "dropping reply for dead connection");
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    pub fn connections_for(&self, principal_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .principals
            .get(principal_id)
            .map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connect(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(tx), rx)
    }

    #[test]
    fn principal_supports_multiple_connections() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry);
        let (b, _rx_b) = connect(&registry);

        registry.authenticate(a, "p1");
        registry.authenticate(b, "p1");
        assert_eq!(registry.connections_for("p1"), 2);

        registry.remove(a);
        assert_eq!(registry.connections_for("p1"), 1);
        registry.remove(b);
        assert_eq!(registry.connections_for("p1"), 0);
    }

    #[test]
    fn room_delivery_is_exactly_once_per_member() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = connect(&registry);
        let (b, mut rx_b) = connect(&registry);
        let (c, mut rx_c) = connect(&registry);

        registry.join_room(a, "chat-1");
        registry.join_room(a, "chat-1"); // idempotent
        registry.join_room(b, "chat-1");
        registry.join_room(c, "chat-2");

        assert_eq!(registry.send_to_room("chat-1", "hello"), 2);
        assert_eq!(rx_a.try_recv().unwrap(), "hello");
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), "hello");
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn leaving_a_room_stops_delivery() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = connect(&registry);
        let (b, mut rx_b) = connect(&registry);

        registry.join_room(a, "chat-1");
        registry.join_room(b, "chat-1");
        registry.leave_room(a, "chat-1");

        assert_eq!(registry.send_to_room("chat-1", "x"), 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), "x");
    }

    #[test]
    fn disconnect_purges_rooms() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry);
        registry.authenticate(a, "p1");
        registry.join_room(a, "chat-1");
        registry.join_room(a, "chat-2");

        registry.remove(a);
        assert_eq!(registry.send_to_room("chat-1", "x"), 0);
        assert_eq!(registry.send_to_room("chat-2", "x"), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn rebinding_moves_the_principal_index() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry);
        registry.authenticate(a, "p1");
        registry.authenticate(a, "p2");

        assert_eq!(registry.connections_for("p1"), 0);
        assert_eq!(registry.connections_for("p2"), 1);
        assert_eq!(registry.principal_of(a).as_deref(), Some("p2"));
    }
}
