//! Message store: appends, the recent-message window and read state.
//!
//! Two cache entries are patched in place rather than invalidated: the
//! recent window of a room (push newest, trim oldest) and the unread
//! counters of the other participants (increment). Both patches only touch
//! entries that already exist, and the store write behind them runs inside a
//! [`PendingPatch`] so no loader caches a snapshot taken mid-write. Any
//! change to read flags invalidates the window, and a full read invalidates
//! the reader's counter, so the next read recomputes them from the store.

use crate::cache::{self, keys, Cache, PendingPatch};
use crate::error::ChatError;
use crate::store::{ChatStore, StoreError};
use parley_protocol::{Message, MessageId, Room, RoomId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Message store tuning.
#[derive(Debug, Clone)]
pub struct MessageConfig {
    /// Size of the cached recent window per room.
    pub recent_limit: usize,
    /// Lifetime of cached windows and counters.
    pub ttl: Duration,
    /// Longest accepted message, in characters.
    pub max_text_length: usize,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            recent_limit: 50,
            ttl: Duration::from_secs(3600),
            max_text_length: 4000,
        }
    }
}

/// Appends messages and tracks what each reader has read.
pub struct MessageStore {
    chats: Arc<dyn ChatStore>,
    cache: Arc<dyn Cache>,
    config: MessageConfig,
}

impl MessageStore {
    #[must_use]
    pub fn new(chats: Arc<dyn ChatStore>, cache: Arc<dyn Cache>, config: MessageConfig) -> Self {
        Self {
            chats,
            cache,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &MessageConfig {
        &self.config
    }

    /// Check message text before anything else happens.
    ///
    /// # Errors
    ///
    /// [`ChatError::EmptyText`] for blank text, [`ChatError::TextTooLong`]
    /// past the configured limit.
    pub fn validate_text(&self, text: &str) -> Result<(), ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyText);
        }
        if text.chars().count() > self.config.max_text_length {
            return Err(ChatError::TextTooLong {
                max: self.config.max_text_length,
            });
        }
        Ok(())
    }

    /// Re-read the room and check the sender still belongs to it.
    async fn room_for_writer(&self, room_id: &RoomId, sender: &UserId) -> Result<Room, ChatError> {
        let room = match self.chats.find_room(room_id).await? {
            Some(room) if room.is_active => room,
            _ => return Err(ChatError::RoomNotFound(*room_id)),
        };
        if !room.has_participant(sender) {
            return Err(ChatError::RoomAccessDenied(*room_id));
        }
        Ok(room)
    }

    /// Append a message.
    ///
    /// Nothing is written unless the text is valid and the sender is a
    /// participant of the room at this moment.
    ///
    /// # Errors
    ///
    /// [`ChatError::EmptyText`], [`ChatError::TextTooLong`],
    /// [`ChatError::RoomNotFound`], [`ChatError::RoomAccessDenied`], or a
    /// store failure.
    pub async fn append(
        &self,
        room_id: &RoomId,
        sender: &UserId,
        text: &str,
    ) -> Result<Message, ChatError> {
        self.validate_text(text)?;
        let room = self.room_for_writer(room_id, sender).await?;

        let message = Message::new(*room_id, sender.clone(), text);
        let recent_key = keys::recent_messages(room_id);
        let counters: Vec<String> = room.others(sender).map(|r| keys::unread(room_id, r)).collect();
        let mut patched = vec![recent_key.clone()];
        patched.extend(counters.iter().cloned());

        let pending = PendingPatch::open(self.cache.as_ref(), patched).await;
        if let Err(e) = self.chats.append_message(message.clone()).await {
            pending.close().await;
            return Err(e.into());
        }
        debug!(room = %room_id, user = %sender, message = %message.id, "Appended message");

        if pending.is_guarded(&recent_key) {
            self.push_recent(&recent_key, &message).await;
        }
        for key in counters.iter().filter(|k| pending.is_guarded(k)) {
            if let Err(e) = self.cache.incr_if_exists(key, 1).await {
                warn!(room = %room_id, key = %key, error = %e, "Unread increment failed");
                let _ = cache::invalidate(self.cache.as_ref(), key).await; // logged
            }
        }
        pending.close().await;

        Ok(message)
    }

    async fn push_recent(&self, key: &str, message: &Message) {
        let pushed = match serde_json::to_string(message) {
            Ok(raw) => self
                .cache
                .list_push_trim(key, raw, self.config.recent_limit)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = pushed {
            warn!(room = %message.room_id, error = %e, "Recent window push failed");
            let _ = cache::invalidate(self.cache.as_ref(), key).await;
        }
    }

    /// The newest messages of a room, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable on a cache miss.
    pub async fn recent_messages(&self, room_id: &RoomId) -> Result<Vec<Message>, ChatError> {
        let key = keys::recent_messages(room_id);
        let (chats, limit) = (&self.chats, self.config.recent_limit);
        let mut messages = cache::fetch_list(self.cache.as_ref(), &key, self.config.ttl, || async move {
            chats.recent_messages(room_id, limit).await
        })
        .await
        .map_err(ChatError::from)?;

        if messages.len() > limit {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    /// Mark every message in the room not sent by `reader` as read by them.
    ///
    /// The reader's counter is dropped in the same call so it is recounted
    /// as zero. A failed drop is logged; the write has committed and the
    /// counter's version bump or TTL settles it. Returns how many messages
    /// changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    pub async fn mark_all_read_except(&self, room_id: &RoomId, reader: &UserId) -> Result<u64, ChatError> {
        let changed = self.chats.mark_read(room_id, reader).await?;
        let _ = cache::invalidate(self.cache.as_ref(), &keys::unread(room_id, reader)).await; // logged
        if changed > 0 {
            debug!(room = %room_id, user = %reader, changed, "Marked room read");
            let _ = cache::invalidate(self.cache.as_ref(), &keys::recent_messages(room_id)).await;
        }
        Ok(changed)
    }

    /// Mark one message as read by `reader`.
    ///
    /// # Errors
    ///
    /// [`ChatError::MessageNotFound`], [`ChatError::NotAParticipant`] or
    /// [`ChatError::OwnMessage`].
    pub async fn mark_message_read(
        &self,
        message_id: &MessageId,
        reader: &UserId,
    ) -> Result<Message, ChatError> {
        let message = self
            .chats
            .find_message(message_id)
            .await?
            .ok_or(ChatError::MessageNotFound(*message_id))?;
        let room = self
            .chats
            .find_room(&message.room_id)
            .await?
            .ok_or(ChatError::RoomNotFound(message.room_id))?;
        if !room.has_participant(reader) {
            return Err(ChatError::NotAParticipant(room.id));
        }
        if message.sender_id == *reader {
            return Err(ChatError::OwnMessage(*message_id));
        }

        let key = keys::unread(&room.id, reader);
        let pending = PendingPatch::open(self.cache.as_ref(), vec![key.clone()]).await;
        let changed = match self.chats.mark_message_read(message_id, reader).await {
            Ok(changed) => changed,
            Err(e) => {
                pending.close().await;
                return Err(match e {
                    StoreError::NotFound(_) => ChatError::MessageNotFound(*message_id),
                    e => e.into(),
                });
            }
        };
        if changed && pending.is_guarded(&key) {
            match self.cache.incr_if_exists(&key, -1).await {
                Ok(Some(n)) if n >= 0 => {}
                Ok(None) => {}
                Ok(Some(_)) | Err(_) => {
                    let _ = cache::invalidate(self.cache.as_ref(), &key).await;
                }
            }
        }
        pending.close().await;
        if changed {
            let _ = cache::invalidate(self.cache.as_ref(), &keys::recent_messages(&room.id)).await;
        }

        self.chats
            .find_message(message_id)
            .await?
            .ok_or(ChatError::MessageNotFound(*message_id))
    }

    /// Messages in the room the reader has not read yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable on a cache miss.
    pub async fn unread_count(&self, room_id: &RoomId, reader: &UserId) -> Result<u64, ChatError> {
        let key = keys::unread(room_id, reader);
        let chats = &self.chats;
        let count = cache::fetch(self.cache.as_ref(), &key, self.config.ttl, || async move {
            Ok::<_, StoreError>(Some(chats.count_unread(room_id, reader).await?))
        })
        .await?;
        Ok(count.unwrap_or_default())
    }
}
