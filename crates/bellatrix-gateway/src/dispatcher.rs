use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use bellatrix_types::events::GatewayEvent;

pub type ConnId = Uuid;

/// Where an outbound event goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Everyone in the couple's room, optionally skipping one connection
    Room { couple_id: i64, exclude: Option<ConnId> },
    /// A single connection
    Connection(ConnId),
}

/// An event produced by a command handler, not yet delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Delivery,
    pub event: GatewayEvent,
}

impl Outbound {
    pub fn room(couple_id: i64, event: GatewayEvent) -> Self {
        Self {
            to: Delivery::Room { couple_id, exclude: None },
            event,
        }
    }

    pub fn room_except(couple_id: i64, exclude: ConnId, event: GatewayEvent) -> Self {
        Self {
            to: Delivery::Room {
                couple_id,
                exclude: Some(exclude),
            },
            event,
        }
    }

    pub fn connection(conn_id: ConnId, event: GatewayEvent) -> Self {
        Self {
            to: Delivery::Connection(conn_id),
            event,
        }
    }
}

struct ConnectionEntry {
    user_id: i64,
    username: String,
    room: Option<i64>,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// Registry of live gateway connections and the couple rooms they joined.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    connections: RwLock<HashMap<ConnId, ConnectionEntry>>,

    /// couple_id -> connections currently in that room
    rooms: RwLock<HashMap<i64, HashSet<ConnId>>>,

    /// Held for the whole of one room fan-out so that concurrent broadcasts
    /// reach every member in the same order.
    fanout: Mutex<()>,

    room_locks: RwLock<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connections: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                fanout: Mutex::new(()),
                room_locks: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new connection. Returns (conn_id, receiver of its outbound queue).
    pub async fn register(
        &self,
        user_id: i64,
        username: String,
    ) -> (ConnId, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.write().await.insert(
            conn_id,
            ConnectionEntry {
                user_id,
                username,
                room: None,
                tx,
            },
        );
        (conn_id, rx)
    }

    /// Drop a connection and take it out of its room.
    pub async fn unregister(&self, conn_id: ConnId) {
        let entry = self.inner.connections.write().await.remove(&conn_id);
        if let Some(couple_id) = entry.and_then(|e| e.room) {
            self.leave_room(conn_id, couple_id).await;
        }
    }

    /// Put a connection in a couple's room, moving it out of any other room.
    /// Returns false when the connection is not registered.
    pub async fn join(&self, conn_id: ConnId, couple_id: i64) -> bool {
        let previous = {
            let mut connections = self.inner.connections.write().await;
            let Some(entry) = connections.get_mut(&conn_id) else {
                return false;
            };
            entry.room.replace(couple_id)
        };

        if let Some(old) = previous.filter(|old| *old != couple_id) {
            self.leave_room(conn_id, old).await;
        }

        self.inner
            .rooms
            .write()
            .await
            .entry(couple_id)
            .or_default()
            .insert(conn_id);

        // unregister may have run between the two steps above
        if !self.inner.connections.read().await.contains_key(&conn_id) {
            self.leave_room(conn_id, couple_id).await;
            return false;
        }
        true
    }

    /// Serializes sends within one room. Held from the insert of a message
    /// until its broadcast has been queued, so live order matches id order.
    pub async fn lock_room(&self, couple_id: i64) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .room_locks
            .write()
            .await
            .entry(couple_id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn leave_room(&self, conn_id: ConnId, couple_id: i64) {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(members) = rooms.get_mut(&couple_id) {
            members.remove(&conn_id);
            if members.is_empty() {
                rooms.remove(&couple_id);
            }
        }
    }

    /// Deliver an event to every connection in a room except `exclude`.
    /// Returns how many connections it was queued for.
    pub async fn emit_to_room(&self, couple_id: i64, event: &GatewayEvent, exclude: Option<ConnId>) -> usize {
        let _order = self.inner.fanout.lock().await;

        let members: Vec<ConnId> = match self.inner.rooms.read().await.get(&couple_id) {
            Some(members) => members
                .iter()
                .copied()
                .filter(|id| Some(*id) != exclude)
                .collect(),
            None => return 0,
        };

        let connections = self.inner.connections.read().await;
        let mut delivered = 0;
        for conn_id in members {
            if let Some(entry) = connections.get(&conn_id) {
                // A closed queue means the connection is tearing down
                if entry.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }

        debug!("{} -> room {} ({} connections)", event.name(), couple_id, delivered);
        delivered
    }

    /// Send an event to one connection.
    pub async fn send_to(&self, conn_id: ConnId, event: GatewayEvent) -> bool {
        let connections = self.inner.connections.read().await;
        match connections.get(&conn_id) {
            Some(entry) => entry.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Apply the outbound list of a command handler, in order.
    pub async fn deliver(&self, outbound: Vec<Outbound>) {
        for Outbound { to, event } in outbound {
            match to {
                Delivery::Room { couple_id, exclude } => {
                    self.emit_to_room(couple_id, &event, exclude).await;
                }
                Delivery::Connection(conn_id) => {
                    self.send_to(conn_id, event).await;
                }
            }
        }
    }

    /// Number of live connections in a couple's room.
    pub async fn room_members(&self, couple_id: i64) -> usize {
        self.inner
            .rooms
            .read()
            .await
            .get(&couple_id)
            .map_or(0, HashSet::len)
    }

    /// (user_id, username) of every connection in a room.
    pub async fn room_users(&self, couple_id: i64) -> Vec<(i64, String)> {
        let rooms = self.inner.rooms.read().await;
        let Some(members) = rooms.get(&couple_id) else {
            return Vec::new();
        };
        let connections = self.inner.connections.read().await;
        members
            .iter()
            .filter_map(|id| connections.get(id))
            .map(|e| (e.user_id, e.username.clone()))
            .collect()
    }
}
