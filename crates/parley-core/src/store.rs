//! Durable store for users, rooms and messages.
//!
//! The store is the source of truth; the cache only ever holds values
//! derived from it. [`MemoryStore`] keeps everything behind one lock so
//! multi-record writes (append + last-message pointer, pair-key uniqueness)
//! are atomic.

use async_trait::async_trait;
use parley_protocol::{Message, MessageId, Room, RoomId, User, UserId};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint was violated.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A record the write depends on is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Read access to users. Users are owned outside the chat backbone.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: &UserId) -> Result<Option<User>, StoreError>;

    async fn list_users(&self) -> Result<Vec<User>, StoreError>;

    /// Insert or replace a user.
    async fn create_user(&self, user: User) -> Result<(), StoreError>;
}

/// Rooms and messages.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError>;

    /// Look up a direct room by canonical pair key, active or not.
    async fn find_room_by_pair_key(&self, key: &str) -> Result<Option<Room>, StoreError>;

    /// Insert a new room.
    ///
    /// Fails with [`StoreError::Conflict`] when a direct room already exists
    /// for the same pair.
    async fn insert_room(&self, room: Room) -> Result<(), StoreError>;

    /// Rooms the user participates in, active only, newest activity first.
    async fn rooms_for_user(&self, user: &UserId) -> Result<Vec<Room>, StoreError>;

    async fn set_room_active(&self, id: &RoomId, active: bool) -> Result<(), StoreError>;

    /// Persist a message and advance the room's last-message pointer in one
    /// atomic step.
    async fn append_message(&self, message: Message) -> Result<(), StoreError>;

    async fn find_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError>;

    /// Batch lookup. Missing ids are skipped.
    async fn find_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>, StoreError>;

    /// The newest `limit` messages of a room, oldest first.
    async fn recent_messages(&self, room: &RoomId, limit: usize)
        -> Result<Vec<Message>, StoreError>;

    /// Add `reader`'s receipt to every message in the room they did not send.
    /// Returns how many messages changed.
    async fn mark_read(&self, room: &RoomId, reader: &UserId) -> Result<u64, StoreError>;

    /// Add `reader`'s receipt to one message. Returns `false` if it was
    /// already there.
    async fn mark_message_read(&self, id: &MessageId, reader: &UserId)
        -> Result<bool, StoreError>;

    /// Messages in the room not sent by and not yet read by `reader`.
    async fn count_unread(&self, room: &RoomId, reader: &UserId) -> Result<u64, StoreError>;

    /// Delete every message of a room. Returns how many were removed.
    async fn archive_messages(&self, room: &RoomId) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<UserId, User>,
    rooms: HashMap<RoomId, Room>,
    pair_index: HashMap<String, RoomId>,
    messages: HashMap<MessageId, Message>,
    /// Message ids per room in append order.
    timelines: HashMap<RoomId, Vec<MessageId>>,
}

impl Inner {
    fn room_participants(&self, room: &RoomId) -> Option<usize> {
        self.rooms.get(room).map(|r| r.participant_ids.len())
    }

    fn receipt(&mut self, id: &MessageId, reader: &UserId, participants: usize) -> bool {
        let Some(message) = self.messages.get_mut(id) else {
            return false;
        };
        if message.sender_id == *reader || !message.read_by.insert(reader.clone()) {
            return false;
        }
        // Everyone except the sender has read it.
        message.is_read = message.read_by.len() + 1 >= participants;
        true
    }

    fn last_activity(&self, room: &Room) -> chrono::DateTime<chrono::Utc> {
        room.last_message_id
            .and_then(|id| self.messages.get(&id))
            .map_or(room.created_at, |m| m.created_at)
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with users.
    #[must_use]
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let inner = Inner {
            users: users.into_iter().map(|u| (u.id.clone(), u)).collect(),
            ..Inner::default()
        };
        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Total number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    /// Total number of stored rooms.
    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        Ok(self.inner.read().await.users.get(id).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let inner = self.inner.read().await;
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }

    async fn create_user(&self, user: User) -> Result<(), StoreError> {
        self.inner.write().await.users.insert(user.id.clone(), user);
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn find_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
        Ok(self.inner.read().await.rooms.get(id).cloned())
    }

    async fn find_room_by_pair_key(&self, key: &str) -> Result<Option<Room>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .pair_index
            .get(key)
            .and_then(|id| inner.rooms.get(id))
            .cloned())
    }

    async fn insert_room(&self, room: Room) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.rooms.contains_key(&room.id) {
            return Err(StoreError::Conflict(format!("room {} exists", room.id)));
        }
        if let Some(key) = room.pair_key() {
            if inner.pair_index.contains_key(&key) {
                return Err(StoreError::Conflict(format!("direct room for {key} exists")));
            }
            inner.pair_index.insert(key, room.id);
        }
        inner.timelines.insert(room.id, Vec::new());
        inner.rooms.insert(room.id, room);
        Ok(())
    }

    async fn rooms_for_user(&self, user: &UserId) -> Result<Vec<Room>, StoreError> {
        let inner = self.inner.read().await;
        let mut rooms: Vec<Room> = inner
            .rooms
            .values()
            .filter(|r| r.is_active && r.has_participant(user))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| inner.last_activity(b).cmp(&inner.last_activity(a)));
        Ok(rooms)
    }

    async fn set_room_active(&self, id: &RoomId, active: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let room = inner
            .rooms
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("room {id}")))?;
        room.is_active = active;
        Ok(())
    }

    async fn append_message(&self, message: Message) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let room = inner
            .rooms
            .get_mut(&message.room_id)
            .ok_or_else(|| StoreError::NotFound(format!("room {}", message.room_id)))?;
        room.last_message_id = Some(message.id);
        inner
            .timelines
            .entry(message.room_id)
            .or_default()
            .push(message.id);
        inner.messages.insert(message.id, message);
        Ok(())
    }

    async fn find_message(&self, id: &MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.inner.read().await.messages.get(id).cloned())
    }

    async fn find_messages(&self, ids: &[MessageId]) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .cloned()
            .collect())
    }

    async fn recent_messages(
        &self,
        room: &RoomId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let Some(timeline) = inner.timelines.get(room) else {
            return Ok(Vec::new());
        };
        let start = timeline.len().saturating_sub(limit);
        Ok(timeline[start..]
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .cloned()
            .collect())
    }

    async fn mark_read(&self, room: &RoomId, reader: &UserId) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let participants = inner
            .room_participants(room)
            .ok_or_else(|| StoreError::NotFound(format!("room {room}")))?;
        let ids = inner.timelines.get(room).cloned().unwrap_or_default();
        let mut changed = 0;
        for id in &ids {
            if inner.receipt(id, reader, participants) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn mark_message_read(
        &self,
        id: &MessageId,
        reader: &UserId,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let room = inner
            .messages
            .get(id)
            .map(|m| m.room_id)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        let participants = inner.room_participants(&room).unwrap_or(2);
        Ok(inner.receipt(id, reader, participants))
    }

    async fn count_unread(&self, room: &RoomId, reader: &UserId) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        let Some(timeline) = inner.timelines.get(room) else {
            return Ok(0);
        };
        Ok(timeline
            .iter()
            .filter_map(|id| inner.messages.get(id))
            .filter(|m| m.is_unread_for(reader))
            .count() as u64)
    }

    async fn archive_messages(&self, room: &RoomId) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let ids = inner.timelines.insert(*room, Vec::new()).unwrap_or_default();
        for id in &ids {
            inner.messages.remove(id);
        }
        if let Some(r) = inner.rooms.get_mut(room) {
            r.last_message_id = None;
        }
        Ok(ids.len() as u64)
    }
}
