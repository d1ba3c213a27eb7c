use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

use murmur_types::events::ServerEvent;

/// What the writer task of a connection is asked to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Event(ServerEvent),
    /// Send a close frame and stop writing.
    Close { code: u16, reason: String },
}

pub type ConnSender = mpsc::UnboundedSender<Outbound>;

/// Live connections grouped by room.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<Uuid, RoomConnections>>>,
}

#[derive(Default)]
struct RoomConnections {
    /// conn_id -> (user_id, sender)
    connections: HashMap<Uuid, (Uuid, ConnSender)>,
    /// user_id -> number of open connections in this room
    users: HashMap<Uuid, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn connect(&self, room_id: Uuid, user_id: Uuid, conn_id: Uuid, sender: ConnSender) {
        let mut rooms = self.inner.write().await;
        let room = rooms.entry(room_id).or_default();
        if room.connections.insert(conn_id, (user_id, sender)).is_none() {
            *room.users.entry(user_id).or_insert(0) += 1;
        }
        debug!("Connection {} of {} added to room {}", conn_id, user_id, room_id);
    }

    /// Removes one connection. Returns true when it was the user's last one
    /// in the room. Only the connection's owner can remove it.
    pub async fn disconnect(&self, room_id: Uuid, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut rooms = self.inner.write().await;
        let Some(room) = rooms.get_mut(&room_id) else {
            return false;
        };

        match room.connections.get(&conn_id) {
            Some((owner, _)) if *owner == user_id => {
                room.connections.remove(&conn_id);
            }
            _ => return false,
        }

        let gone = match room.users.get_mut(&user_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                room.users.remove(&user_id);
                true
            }
        };

        if room.connections.is_empty() {
            rooms.remove(&room_id);
            debug!("Room {} has no live connections left", room_id);
        }
        gone
    }

    /// Best effort: a closed receiver is skipped and left for its own
    /// connection to clean up. Returns how many connections accepted the event.
    pub async fn broadcast(&self, room_id: Uuid, event: &ServerEvent) -> usize {
        let rooms = self.inner.read().await;
        let Some(room) = rooms.get(&room_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (conn_id, (_, tx)) in &room.connections {
            if tx.send(Outbound::Event(event.clone())).is_ok() {
                delivered += 1;
            } else {
                trace!("Dropped event for closed connection {}", conn_id);
            }
        }
        delivered
    }

    pub async fn is_online(&self, room_id: Uuid, user_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .get(&room_id)
            .is_some_and(|room| room.users.contains_key(&user_id))
    }

    pub async fn online_users(&self, room_id: Uuid) -> Vec<Uuid> {
        self.inner
            .read()
            .await
            .get(&room_id)
            .map(|room| room.users.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Asks every connection of `user_id` in the room to close. The
    /// connections deregister themselves on the way out.
    pub async fn evict(&self, room_id: Uuid, user_id: Uuid, code: u16, reason: &str) -> usize {
        let rooms = self.inner.read().await;
        let Some(room) = rooms.get(&room_id) else {
            return 0;
        };

        room.connections
            .values()
            .filter(|(owner, _)| *owner == user_id)
            .filter(|(_, tx)| {
                tx.send(Outbound::Close {
                    code,
                    reason: reason.to_string(),
                })
                .is_ok()
            })
            .count()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.len()
    }
}
