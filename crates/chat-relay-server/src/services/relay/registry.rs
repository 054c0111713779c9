use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{ConnectionId, ConversationId, ParticipantRole, RelayEvent, VisitorInfo};

/// Outbound side of one live connection.
#[derive(Debug, Clone)]
pub struct ParticipantHandle {
    pub connection_id: ConnectionId,
    pub role: ParticipantRole,
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl ParticipantHandle {
    /// Create a handle plus the receiver the transport drains.
    pub fn channel(role: ParticipantRole) -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                connection_id: Uuid::new_v4(),
                role,
                tx,
            },
            rx,
        )
    }

    pub fn with_role(&self, role: ParticipantRole) -> Self {
        Self {
            role,
            ..self.clone()
        }
    }

    /// Returns false when the connection is gone.
    pub fn send(&self, event: RelayEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn info(&self) -> Participant {
        Participant {
            connection_id: self.connection_id,
            role: self.role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub role: ParticipantRole,
}

#[derive(Debug)]
struct Room {
    participants: HashMap<ConnectionId, ParticipantHandle>,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<ConversationId, Room>,
    admins: HashMap<ConnectionId, ParticipantHandle>,
    visitors: HashMap<ConversationId, VisitorInfo>,
}

/// Process-wide map of live rooms, the admin observer set and visitor metadata.
///
/// The lock is only held for map updates and handle snapshots; sends happen
/// on cloned handles after it is released.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `handle` to the room, creating the room if needed.
    /// Returns true when the room was created.
    pub fn join(&self, conversation_id: &str, handle: ParticipantHandle) -> bool {
        let mut inner = self.inner.write();
        let mut created = false;
        let room = inner
            .rooms
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                created = true;
                Room {
                    participants: HashMap::new(),
                    created_at: Utc::now(),
                }
            });
        debug!(
            conversation_id = %conversation_id,
            connection_id = %handle.connection_id,
            role = ?handle.role,
            "Participant joined room"
        );
        room.participants.insert(handle.connection_id, handle);
        if created {
            info!(conversation_id = %conversation_id, "Room opened");
        }
        created
    }

    /// Subscribe `handle` to the global observability stream.
    pub fn join_admin_stream(&self, handle: ParticipantHandle) {
        debug!(connection_id = %handle.connection_id, "Admin observer attached");
        self.inner.write().admins.insert(handle.connection_id, handle);
    }

    /// Detach from one room. Unknown ids are a no-op.
    pub fn leave_room(&self, conversation_id: &str, connection_id: ConnectionId) {
        let mut inner = self.inner.write();
        let now_empty = match inner.rooms.get_mut(conversation_id) {
            Some(room) => {
                room.participants.remove(&connection_id);
                room.participants.is_empty()
            }
            None => return,
        };
        if now_empty {
            inner.rooms.remove(conversation_id);
            info!(conversation_id = %conversation_id, "Room closed");
        }
    }

    /// Detach a connection everywhere. Unknown ids are a no-op.
    /// Returns the rooms it was removed from.
    pub fn leave(&self, connection_id: ConnectionId) -> Vec<ConversationId> {
        let mut inner = self.inner.write();
        inner.admins.remove(&connection_id);

        let mut left = Vec::new();
        inner.rooms.retain(|conversation_id, room| {
            if room.participants.remove(&connection_id).is_some() {
                left.push(conversation_id.clone());
            }
            !room.participants.is_empty()
        });
        left
    }

    pub fn participants_of(&self, conversation_id: &str) -> HashSet<Participant> {
        self.inner
            .read()
            .rooms
            .get(conversation_id)
            .map(|room| room.participants.values().map(ParticipantHandle::info).collect())
            .unwrap_or_default()
    }

    pub fn has_agent(&self, conversation_id: &str) -> bool {
        self.inner
            .read()
            .rooms
            .get(conversation_id)
            .is_some_and(|room| {
                room.participants
                    .values()
                    .any(|p| p.role == ParticipantRole::Agent)
            })
    }

    pub fn room_created_at(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .rooms
            .get(conversation_id)
            .map(|room| room.created_at)
    }

    pub fn room_count(&self) -> usize {
        self.inner.read().rooms.len()
    }

    /// Snapshot of the room topic's subscribers.
    pub fn room_subscribers(&self, conversation_id: &str) -> Vec<ParticipantHandle> {
        self.inner
            .read()
            .rooms
            .get(conversation_id)
            .map(|room| room.participants.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the admin topic's subscribers.
    pub fn admin_subscribers(&self) -> Vec<ParticipantHandle> {
        self.inner.read().admins.values().cloned().collect()
    }

    pub fn register_visitor(&self, conversation_id: &str, visitor: VisitorInfo) {
        self.inner
            .write()
            .visitors
            .insert(conversation_id.to_string(), visitor);
    }

    pub fn active_chats(&self) -> HashMap<ConversationId, VisitorInfo> {
        self.inner.read().visitors.clone()
    }

    /// Drop every room, observer and visitor record.
    pub fn reset(&self) {
        *self.inner.write() = RegistryInner::default();
    }
}
