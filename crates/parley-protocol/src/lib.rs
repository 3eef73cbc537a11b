//! # parley-protocol
//!
//! Wire protocol definitions for the Parley chat backbone.
//!
//! Every message over a connection is a named event with a payload:
//!
//! - `joinRoom` / `leaveRoom` - Room subscription
//! - `sendMessage` - Append a message and fan it out
//! - `typing` - Ephemeral typing indicator
//! - `getUserList` - Users annotated with presence
//! - `exception` - Structured failure report
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let event = codec::decode_text(r#"{"event":"getUserList"}"#).unwrap();
//! assert_eq!(event, ClientEvent::GetUserList);
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod codec;
pub mod events;
pub mod types;

pub use codec::{decode_text, encode, Encoded, ProtocolError, WireFormat};
pub use events::{
    names, ClientEvent, CreateRoom, Envelope, ExceptionPayload, GetUnreadCount, JoinRoom,
    LeaveRoom, MarkRead, RoomSelector, SendMessage, ServerEvent, Typing, TypingStatus,
    UnreadCount,
};
pub use types::{
    direct_pair_key, Message, MessageId, PresenceStatus, Room, RoomId, RoomKind, RoomSummary,
    User, UserId, UserWithPresence,
};
