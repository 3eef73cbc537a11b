//! Event types for the Parley protocol.
//!
//! Every exchange over the socket is a named event with a payload. Clients
//! send [`ClientEvent`]s wrapped in an [`Envelope`]; the server answers and
//! fans out [`ServerEvent`]s, which serialize to the same envelope shape.

use crate::codec::ProtocolError;
use crate::types::{
    Message, MessageId, PresenceStatus, RoomId, RoomSummary, UserId, UserWithPresence,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Event names.
pub mod names {
    pub const JOIN_ROOM: &str = "joinRoom";
    pub const LEAVE_ROOM: &str = "leaveRoom";
    pub const SEND_MESSAGE: &str = "sendMessage";
    pub const TYPING: &str = "typing";
    pub const GET_USER_LIST: &str = "getUserList";
    pub const CREATE_ROOM: &str = "createRoom";
    pub const MARK_READ: &str = "markRead";
    pub const GET_UNREAD_COUNT: &str = "getUnreadCount";

    pub const USER_ALL_CHATS: &str = "userAllChats";
    pub const MESSAGES: &str = "messages";
    pub const NEW_MESSAGE: &str = "newMessage";
    pub const CHAT_LIST: &str = "chatList";
    pub const ONLINE_STATUS: &str = "online-status-user";
    pub const EXCEPTION: &str = "exception";
    pub const ROOM_INFO: &str = "roomInfo";
    pub const USER_LIST: &str = "userList";
    pub const UNREAD_COUNT: &str = "unreadCount";
}

/// The raw `name:payload` pair as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// How a client picks the room it wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomSelector {
    /// An existing room by id.
    Room(RoomId),
    /// The direct room shared with this user, created on demand.
    Direct(UserId),
}

/// Payload of `joinRoom`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
}

impl JoinRoom {
    /// An explicit room id wins over a receiver id.
    #[must_use]
    pub fn selector(&self) -> Option<RoomSelector> {
        select(self.room_id, self.receiver_id.as_ref())
    }
}

/// Payload of `leaveRoom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRoom {
    pub room_id: RoomId,
}

/// Payload of `sendMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub text: String,
}

impl SendMessage {
    #[must_use]
    pub fn selector(&self) -> Option<RoomSelector> {
        select(self.room_id, self.receiver_id.as_ref())
    }
}

fn select(room_id: Option<RoomId>, receiver_id: Option<&UserId>) -> Option<RoomSelector> {
    match (room_id, receiver_id) {
        (Some(id), _) => Some(RoomSelector::Room(id)),
        (None, Some(user)) => Some(RoomSelector::Direct(user.clone())),
        (None, None) => None,
    }
}

/// Payload of client `typing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub room_id: RoomId,
    #[serde(default = "default_true")]
    pub is_typing: bool,
}

fn default_true() -> bool {
    true
}

/// Payload of `createRoom`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoom {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

/// Payload of `markRead`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    pub message_id: MessageId,
}

/// Payload of `getUnreadCount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetUnreadCount {
    pub room_id: RoomId,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinRoom(JoinRoom),
    LeaveRoom(LeaveRoom),
    SendMessage(SendMessage),
    Typing(Typing),
    GetUserList,
    CreateRoom(CreateRoom),
    MarkRead(MarkRead),
    GetUnreadCount(GetUnreadCount),
}

impl ClientEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom(_) => names::JOIN_ROOM,
            ClientEvent::LeaveRoom(_) => names::LEAVE_ROOM,
            ClientEvent::SendMessage(_) => names::SEND_MESSAGE,
            ClientEvent::Typing(_) => names::TYPING,
            ClientEvent::GetUserList => names::GET_USER_LIST,
            ClientEvent::CreateRoom(_) => names::CREATE_ROOM,
            ClientEvent::MarkRead(_) => names::MARK_READ,
            ClientEvent::GetUnreadCount(_) => names::GET_UNREAD_COUNT,
        }
    }

    /// Decode an envelope into a typed client event.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown event names or payloads of the wrong shape.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { event, data } = envelope;
        let event = match event.as_str() {
            names::JOIN_ROOM => ClientEvent::JoinRoom(payload(&event, data)?),
            names::LEAVE_ROOM => ClientEvent::LeaveRoom(payload(&event, data)?),
            names::SEND_MESSAGE => ClientEvent::SendMessage(payload(&event, data)?),
            names::TYPING => ClientEvent::Typing(payload(&event, data)?),
            names::GET_USER_LIST => ClientEvent::GetUserList,
            names::CREATE_ROOM => ClientEvent::CreateRoom(payload(&event, data)?),
            names::MARK_READ => ClientEvent::MarkRead(payload(&event, data)?),
            names::GET_UNREAD_COUNT => ClientEvent::GetUnreadCount(payload(&event, data)?),
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };
        Ok(event)
    }

    /// Wrap this event in an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let data = match self {
            ClientEvent::JoinRoom(p) => serde_json::to_value(p)?,
            ClientEvent::LeaveRoom(p) => serde_json::to_value(p)?,
            ClientEvent::SendMessage(p) => serde_json::to_value(p)?,
            ClientEvent::Typing(p) => serde_json::to_value(p)?,
            ClientEvent::GetUserList => serde_json::Value::Null,
            ClientEvent::CreateRoom(p) => serde_json::to_value(p)?,
            ClientEvent::MarkRead(p) => serde_json::to_value(p)?,
            ClientEvent::GetUnreadCount(p) => serde_json::to_value(p)?,
        };
        Ok(Envelope {
            event: self.name().to_string(),
            data,
        })
    }
}

fn payload<T: DeserializeOwned>(event: &str, data: serde_json::Value) -> Result<T, ProtocolError> {
    // A missing payload is read as an empty object so all-optional payloads decode.
    let data = if data.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        event: event.to_string(),
        reason: e.to_string(),
    })
}

/// Server-side `typing` broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    pub room_id: RoomId,
    pub user: UserId,
    pub is_typing: bool,
}

/// Answer to `getUnreadCount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnreadCount {
    pub room_id: RoomId,
    pub count: u64,
}

/// Structured failure report sent to the originating session only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub status: u16,
    pub message: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl ExceptionPayload {
    /// Create an exception payload stamped with the current time.
    #[must_use]
    pub fn new(status: u16, error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

/// An event pushed from the server to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// The user's chat list, sent once on connect.
    #[serde(rename = "userAllChats")]
    UserAllChats(Vec<RoomSummary>),

    /// Recent message window of a room, sent to every room subscriber on join.
    #[serde(rename = "messages")]
    Messages(Vec<Message>),

    /// A freshly appended message.
    #[serde(rename = "newMessage")]
    NewMessage(Message),

    /// Refreshed chat list after a room was created.
    #[serde(rename = "chatList")]
    ChatList(Vec<RoomSummary>),

    /// Presence change.
    #[serde(rename = "online-status-user")]
    OnlineStatus(PresenceStatus),

    /// Someone is typing in a room.
    #[serde(rename = "typing")]
    Typing(TypingStatus),

    /// Operation failure.
    #[serde(rename = "exception")]
    Exception(ExceptionPayload),

    /// Details of the room just joined.
    #[serde(rename = "roomInfo")]
    RoomInfo(RoomSummary),

    /// All known users with live presence.
    #[serde(rename = "userList")]
    UserList(Vec<UserWithPresence>),

    /// Unread count for one room.
    #[serde(rename = "unreadCount")]
    UnreadCount(UnreadCount),
}

impl ServerEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UserAllChats(_) => names::USER_ALL_CHATS,
            ServerEvent::Messages(_) => names::MESSAGES,
            ServerEvent::NewMessage(_) => names::NEW_MESSAGE,
            ServerEvent::ChatList(_) => names::CHAT_LIST,
            ServerEvent::OnlineStatus(_) => names::ONLINE_STATUS,
            ServerEvent::Typing(_) => names::TYPING,
            ServerEvent::Exception(_) => names::EXCEPTION,
            ServerEvent::RoomInfo(_) => names::ROOM_INFO,
            ServerEvent::UserList(_) => names::USER_LIST,
            ServerEvent::UnreadCount(_) => names::UNREAD_COUNT,
        }
    }
}
