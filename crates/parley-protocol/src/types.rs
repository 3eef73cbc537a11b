//! Wire-visible data model.
//!
//! These are the shapes that cross the socket and the shared cache: users,
//! rooms, messages and the presence-annotated views built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable user identity, as yielded by the identity verifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a user ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// UUID-backed identifiers always travel as hyphenated strings, including in
// MessagePack where `Uuid` would otherwise serialize as raw bytes.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

uuid_id!(
    /// Room identifier.
    RoomId
);

uuid_id!(
    /// Message identifier.
    MessageId
);

/// A user, owned by the external user store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
}

impl User {
    /// Create a user without an avatar.
    #[must_use]
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }
}

/// Room type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomKind {
    /// Exactly two participants, keyed by the unordered pair.
    Direct,
    /// Named room with an owner and one or more invited members.
    Group,
}

/// Canonical key for an unordered direct pair.
///
/// `(a, b)` and `(b, a)` produce the same key. The length prefix keeps the
/// key unambiguous whatever characters the ids contain.
#[must_use]
pub fn direct_pair_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{}:{}", lo.0.len(), lo, hi)
}

/// A conversation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: RoomId,
    pub kind: RoomKind,
    /// Required for group rooms, `None` for direct rooms.
    pub name: Option<String>,
    pub participant_ids: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
    /// Weak back-reference to the newest message.
    pub last_message_id: Option<MessageId>,
    pub is_active: bool,
}

impl Room {
    /// Create a new direct room for a pair of users.
    #[must_use]
    pub fn direct(a: UserId, b: UserId) -> Self {
        Self {
            id: RoomId::generate(),
            kind: RoomKind::Direct,
            name: None,
            participant_ids: [a, b].into_iter().collect(),
            created_at: Utc::now(),
            last_message_id: None,
            is_active: true,
        }
    }

    /// Create a new group room.
    #[must_use]
    pub fn group(name: impl Into<String>, participants: BTreeSet<UserId>) -> Self {
        Self {
            id: RoomId::generate(),
            kind: RoomKind::Group,
            name: Some(name.into()),
            participant_ids: participants,
            created_at: Utc::now(),
            last_message_id: None,
            is_active: true,
        }
    }

    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.kind == RoomKind::Direct
    }

    /// Check if a user is a participant.
    #[must_use]
    pub fn has_participant(&self, user: &UserId) -> bool {
        self.participant_ids.contains(user)
    }

    /// Participants other than `user`.
    pub fn others<'a>(&'a self, user: &'a UserId) -> impl Iterator<Item = &'a UserId> + 'a {
        self.participant_ids.iter().filter(move |p| *p != user)
    }

    /// The other side of a direct room.
    #[must_use]
    pub fn counterpart(&self, user: &UserId) -> Option<&UserId> {
        if self.is_direct() {
            self.participant_ids.iter().find(|p| *p != user)
        } else {
            None
        }
    }

    /// Canonical pair key, for direct rooms only.
    #[must_use]
    pub fn pair_key(&self) -> Option<String> {
        if !self.is_direct() {
            return None;
        }
        let mut ids = self.participant_ids.iter();
        match (ids.next(), ids.next()) {
            (Some(a), Some(b)) => Some(direct_pair_key(a, b)),
            _ => None,
        }
    }
}

/// A chat message.
///
/// Immutable after creation except for read state. `read_by` holds one
/// receipt per reader; `is_read` is set once every participant other than
/// the sender has a receipt, which for a direct room is the single flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
}

impl Message {
    /// Create a new unread message.
    #[must_use]
    pub fn new(room_id: RoomId, sender_id: UserId, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::generate(),
            room_id,
            sender_id,
            text: text.into(),
            created_at: Utc::now(),
            is_read: false,
            read_by: BTreeSet::new(),
        }
    }

    /// Whether `user` still has this message unread.
    #[must_use]
    pub fn is_unread_for(&self, user: &UserId) -> bool {
        self.sender_id != *user && !self.read_by.contains(user)
    }
}

/// Live presence of one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceStatus {
    pub user_id: UserId,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// A user annotated with live presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserWithPresence {
    #[serde(flatten)]
    pub user: User,
    pub is_online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// A room as shown in a chat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    #[serde(flatten)]
    pub room: Room,
    pub last_message: Option<Message>,
    /// The other participant of a direct room, with live presence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart: Option<UserWithPresence>,
}
