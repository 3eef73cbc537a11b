//! Error taxonomy for chat operations.
//!
//! Every operation returns [`ChatError`]. At the session boundary the error
//! is turned into an `exception` event for the originating session only.

use crate::bus::BusError;
use crate::cache::CacheError;
use crate::fanout::FanoutError;
use crate::store::StoreError;
use parley_protocol::{ExceptionPayload, MessageId, ProtocolError, RoomId, UserId};
use thiserror::Error;

/// Handshake authentication failures. Always fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No `Authorization` header.
    #[error("No authorization header found")]
    MissingCredential,

    /// Header present but not `Bearer <jwt>`.
    #[error("Invalid authorization format. Use Bearer token")]
    MalformedCredential,

    /// Signature, expiry or claims check failed.
    #[error("Invalid or expired token")]
    ExpiredOrInvalid,
}

/// Error classes, as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthorized,
    BadRequest,
    NotFound,
    Forbidden,
    Conflict,
    Internal,
}

impl ErrorKind {
    /// HTTP-style status code.
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }

    /// Short label used as the `error` field of an exception.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "Bad Request",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "Not Found",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Internal => "Internal Server Error",
        }
    }
}

/// Operation-level error.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Message text cannot be empty")]
    EmptyText,

    #[error("Message text exceeds {max} characters")]
    TextTooLong { max: usize },

    #[error("Invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("Either roomId or receiverId is required")]
    MissingTarget,

    #[error("Invalid request: {0}")]
    InvalidPayload(String),

    #[error("You cannot mark your own message as read")]
    OwnMessage(MessageId),

    #[error("Room not found")]
    RoomNotFound(RoomId),

    #[error("User not found")]
    UserNotFound(UserId),

    #[error("Message not found")]
    MessageNotFound(MessageId),

    #[error("You are not a participant in this room")]
    NotAParticipant(RoomId),

    #[error("You cannot send messages to this room")]
    RoomAccessDenied(RoomId),

    /// Losing side of a create race; resolved internally by re-reading.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Subscription failed: {0}")]
    Fanout(#[from] FanoutError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

impl From<ProtocolError> for ChatError {
    fn from(err: ProtocolError) -> Self {
        ChatError::InvalidPayload(err.to_string())
    }
}

impl ChatError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::Auth(_) => ErrorKind::Unauthorized,
            ChatError::EmptyText
            | ChatError::TextTooLong { .. }
            | ChatError::InvalidParticipants(_)
            | ChatError::MissingTarget
            | ChatError::InvalidPayload(_)
            | ChatError::OwnMessage(_)
            | ChatError::Fanout(FanoutError::MaxSubscriptionsReached) => ErrorKind::BadRequest,
            ChatError::RoomNotFound(_)
            | ChatError::UserNotFound(_)
            | ChatError::MessageNotFound(_) => ErrorKind::NotFound,
            ChatError::NotAParticipant(_) | ChatError::RoomAccessDenied(_) => ErrorKind::Forbidden,
            ChatError::Conflict(_) => ErrorKind::Conflict,
            ChatError::Fanout(_) | ChatError::Store(_) | ChatError::Cache(_) | ChatError::Bus(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether this is a store/cache/bus failure rather than a caller mistake.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }

    /// Build the wire exception. Internal details never reach the client.
    #[must_use]
    pub fn to_exception(&self) -> ExceptionPayload {
        let kind = self.kind();
        let message = if self.is_infrastructure() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };
        ExceptionPayload::new(kind.status(), kind.label(), message)
    }
}
