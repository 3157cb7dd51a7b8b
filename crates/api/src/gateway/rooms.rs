//! Local connection and room membership registry.
//!
//! Each socket task owns the receiving half of a bounded channel; the registry
//! holds the sender. Room sends never block: a connection whose buffer is full
//! misses the frame.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use herald_common::types::{RealtimeFrame, Room};

pub type ConnectionId = u64;

struct Connection {
    user_id: String,
    tx: mpsc::Sender<RealtimeFrame>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct RoomRegistry {
    next_id: AtomicU64,
    inner: RwLock<Inner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: &str, tx: mpsc::Sender<RealtimeFrame>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.write().connections.insert(
            id,
            Connection {
                user_id: user_id.to_string(),
                tx,
                rooms: HashSet::new(),
            },
        );
        id
    }

    pub fn join(&self, id: ConnectionId, room: Room) {
        let mut inner = self.write();
        let Some(connection) = inner.connections.get_mut(&id) else {
            return;
        };
        connection.rooms.insert(room.clone());
        inner.rooms.entry(room).or_default().insert(id);
    }

    /// Drop the connection and every membership it held.
    pub fn unregister(&self, id: ConnectionId) {
        let mut inner = self.write();
        let Some(connection) = inner.connections.remove(&id) else {
            return;
        };
        for room in connection.rooms {
            if let Some(members) = inner.rooms.get_mut(&room) {
                members.remove(&id);
                if members.is_empty() {
                    inner.rooms.remove(&room);
                }
            }
        }
    }

    /// Queue `frame` for every local member of `room`. Returns the number of
    /// connections it was queued for.
    pub fn send(&self, room: &Room, frame: &RealtimeFrame) -> usize {
        let inner = self.read();
        let targets: Vec<ConnectionId> = match room {
            Room::Broadcast => inner.connections.keys().copied().collect(),
            _ => inner
                .rooms
                .get(room)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default(),
        };

        let mut sent = 0;
        for id in targets {
            let Some(connection) = inner.connections.get(&id) else {
                continue;
            };
            match connection.tx.try_send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => tracing::warn!(
                    connection_id = id,
                    user_id = %connection.user_id,
                    event = %frame.event,
                    "Connection buffer full, dropping frame"
                ),
                // The socket task is already gone and will unregister itself.
                Err(TrySendError::Closed(_)) => {}
            }
        }
        sent
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn room_size(&self, room: &Room) -> usize {
        self.read().rooms.get(room).map_or(0, |members| members.len())
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
