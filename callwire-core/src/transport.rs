//! Per-user event delivery
//!
//! The orchestrator only knows [`SignalSink`]: "deliver this event to that
//! user". [`ConnectionHub`] implements it for live connections, one per user;
//! a second connection for the same user replaces the first.

use crate::events::ServerEvent;
use crate::metrics::{record_gauge, CONNECTIONS_ACTIVE};
use crate::types::UserId;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// Best-effort delivery of events to a user's channel.
///
/// Delivery to a user without a connection is a no-op.
pub trait SignalSink: Send + Sync + Debug {
    fn emit(&self, user: &UserId, event: ServerEvent);

    /// Whether `user` has a live connection right now
    fn has_connection(&self, user: &UserId) -> bool;
}

/// Identifies one registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A registered connection: its id and the receiving end of its outbox
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub outbox: mpsc::UnboundedReceiver<ServerEvent>,
    /// Whether an older connection of the same user was evicted
    pub evicted_previous: bool,
}

#[derive(Debug)]
struct Slot {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Registry of live connections, at most one per user
#[derive(Debug, Default)]
pub struct ConnectionHub {
    slots: Mutex<HashMap<UserId, Slot>>,
    next_id: AtomicU64,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<UserId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection for `user`.
    ///
    /// Any previous connection loses its sender, so its outbox closes and
    /// its transport task winds down.
    pub fn register(&self, user: &UserId) -> Registration {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, outbox) = mpsc::unbounded_channel();

        let (previous, count) = {
            let mut slots = self.slots();
            let previous = slots.insert(user.clone(), Slot { id, tx });
            (previous, slots.len())
        };
        record_gauge(CONNECTIONS_ACTIVE, count as f64);

        if let Some(old) = &previous {
            info!(user_id = %user, old = %old.id, new = %id, "Replacing existing connection");
        } else {
            debug!(user_id = %user, connection = %id, "Connection registered");
        }

        Registration { id, outbox, evicted_previous: previous.is_some() }
    }

    /// Drop `connection` if it is still the user's current one.
    ///
    /// Returns false for connections that were already replaced; their
    /// disconnect must not affect the user's presence.
    pub fn unregister(&self, user: &UserId, connection: ConnectionId) -> bool {
        let (current, count) = {
            let mut slots = self.slots();
            let current = slots.get(user).map(|slot| slot.id == connection).unwrap_or(false);
            if current {
                slots.remove(user);
            }
            (current, slots.len())
        };

        if current {
            record_gauge(CONNECTIONS_ACTIVE, count as f64);
            debug!(user_id = %user, connection = %connection, "Connection unregistered");
        }
        current
    }

    pub fn is_connected(&self, user: &UserId) -> bool {
        self.slots().contains_key(user)
    }

    pub fn connection_count(&self) -> usize {
        self.slots().len()
    }

    /// Close every connection
    pub fn close_all(&self) {
        let mut slots = self.slots();
        info!(connections = slots.len(), "Closing all connections");
        slots.clear();
        record_gauge(CONNECTIONS_ACTIVE, 0.0);
    }
}

impl SignalSink for ConnectionHub {
    fn emit(&self, user: &UserId, event: ServerEvent) {
        let slots = self.slots();
        match slots.get(user) {
            Some(slot) => {
                trace!(user_id = %user, event = event.name(), "Delivering event");
                if slot.tx.send(event).is_err() {
                    debug!(user_id = %user, "Outbox closed, event dropped");
                }
            }
            None => trace!(user_id = %user, event = event.name(), "No connection, event dropped"),
        }
    }

    fn has_connection(&self, user: &UserId) -> bool {
        self.is_connected(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_registered_user() {
        let hub = ConnectionHub::new();
        let alice = UserId::new("alice");
        let mut reg = hub.register(&alice);

        hub.emit(&alice, ServerEvent::error("hello"));
        assert_eq!(reg.outbox.recv().await, Some(ServerEvent::error("hello")));
        assert!(!reg.evicted_previous);
    }

    #[test]
    fn test_emit_to_unknown_user_is_dropped() {
        let hub = ConnectionHub::new();
        hub.emit(&UserId::new("ghost"), ServerEvent::error("x"));
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_new_connection_evicts_old() {
        let hub = ConnectionHub::new();
        let alice = UserId::new("alice");

        let mut first = hub.register(&alice);
        let second = hub.register(&alice);
        assert!(second.evicted_previous);

        // The old outbox is closed
        assert_eq!(first.outbox.recv().await, None);

        // The stale connection's disconnect does not remove the new one
        assert!(!hub.unregister(&alice, first.id));
        assert!(hub.has_connection(&alice));
        assert!(hub.unregister(&alice, second.id));
        assert!(!hub.is_connected(&alice));
    }

    #[tokio::test]
    async fn test_close_all() {
        let hub = ConnectionHub::new();
        let mut reg = hub.register(&UserId::new("a"));
        hub.close_all();
        assert_eq!(reg.outbox.recv().await, None);
        assert_eq!(hub.connection_count(), 0);
    }
}
