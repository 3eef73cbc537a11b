//! Fan-out channels.
//!
//! A channel is a named broadcast group. Every room has one (`room_<id>`),
//! every user has a personal one (`user_<id>`), and all sessions share the
//! global [`PRESENCE_CHANNEL`].

use crate::delivery::Delivery;
use parley_protocol::{RoomId, UserId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Default broadcast channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Channel carrying presence changes for every session.
pub const PRESENCE_CHANNEL: &str = "presence";

/// A channel identifier.
pub type ChannelId = String;

/// Channel of a room.
#[must_use]
pub fn room_channel(room: &RoomId) -> ChannelId {
    format!("room_{room}")
}

/// Personal channel of a user.
#[must_use]
pub fn user_channel(user: &UserId) -> ChannelId {
    format!("user_{user}")
}

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("Channel name contains control characters");
    }
    Ok(())
}

/// A broadcast group of sessions.
#[derive(Debug)]
pub struct Channel {
    name: ChannelId,
    sender: broadcast::Sender<Arc<Delivery>>,
    /// Subscribed socket ids.
    subscribers: HashSet<String>,
}

impl Channel {
    #[must_use]
    pub fn new(name: impl Into<ChannelId>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(name: impl Into<ChannelId>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
            subscribers: HashSet::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn is_subscribed(&self, socket_id: &str) -> bool {
        self.subscribers.contains(socket_id)
    }

    /// Add a socket and hand back its receiver.
    pub fn subscribe(&mut self, socket_id: impl Into<String>) -> broadcast::Receiver<Arc<Delivery>> {
        let socket_id = socket_id.into();
        debug!(channel = %self.name, connection = %socket_id, "Socket subscribed");
        self.subscribers.insert(socket_id);
        self.sender.subscribe()
    }

    /// Returns `true` if the socket was subscribed.
    pub fn unsubscribe(&mut self, socket_id: &str) -> bool {
        let removed = self.subscribers.remove(socket_id);
        if removed {
            debug!(channel = %self.name, connection = %socket_id, "Socket unsubscribed");
        }
        removed
    }

    /// Broadcast to current receivers. Returns how many got it.
    pub fn send(&self, delivery: Arc<Delivery>) -> usize {
        trace!(channel = %self.name, event = delivery.event.name(), "Broadcasting");
        self.sender.send(delivery).unwrap_or_default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::{PresenceStatus, ServerEvent};

    fn online(user: &str) -> Arc<Delivery> {
        Arc::new(Delivery::new(
            PRESENCE_CHANNEL,
            Arc::new(ServerEvent::OnlineStatus(PresenceStatus {
                user_id: user.into(),
                is_online: true,
                last_seen: None,
            })),
        ))
    }

    #[test]
    fn test_channel_names() {
        let room = RoomId::generate();
        assert_eq!(room_channel(&room), format!("room_{room}"));
        assert_eq!(user_channel(&"u2".into()), "user_u2");
        assert!(validate_channel_name(&user_channel(&"ünïcode".into())).is_ok());
    }

    #[test]
    fn test_channel_name_validation() {
        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name("user_\u{7}").is_err());
        assert!(validate_channel_name(&"a".repeat(MAX_CHANNEL_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let mut channel = Channel::new("room_x");
        let _rx = channel.subscribe("s1");
        let _rx2 = channel.subscribe("s2");
        assert_eq!(channel.subscriber_count(), 2);
        assert!(channel.is_subscribed("s1"));

        assert!(channel.unsubscribe("s1"));
        assert!(!channel.unsubscribe("s1"));
        assert_eq!(channel.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_send_reaches_receivers() {
        let mut channel = Channel::new(PRESENCE_CHANNEL);
        let mut rx = channel.subscribe("s1");

        assert_eq!(channel.send(online("u1")), 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.channel, PRESENCE_CHANNEL);
        assert_eq!(got.event.name(), "online-status-user");
    }

    #[test]
    fn test_send_without_receivers() {
        let channel = Channel::new("room_y");
        assert_eq!(channel.send(online("u1")), 0);
    }
}
