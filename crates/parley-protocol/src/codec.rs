//! Codec for encoding and decoding Parley events.
//!
//! Text frames carry JSON envelopes. Binary frames carry the same envelope
//! as MessagePack with length-prefixed framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::events::{ClientEvent, Envelope, ServerEvent};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Event name the server does not handle.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    /// Payload does not match the event's schema.
    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },
}

/// Encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON envelopes in text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack envelopes in binary frames.
    MessagePack,
}

/// An event encoded for one wire format.
#[derive(Debug, Clone, PartialEq)]
pub enum Encoded {
    Text(String),
    Binary(Bytes),
}

impl Encoded {
    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Encoded::Text(text) => text.len(),
            Encoded::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a server event in the given format.
///
/// # Errors
///
/// Returns an error if the event is too large or encoding fails.
pub fn encode(event: &ServerEvent, format: WireFormat) -> Result<Encoded, ProtocolError> {
    match format {
        WireFormat::Json => encode_text(event).map(Encoded::Text),
        WireFormat::MessagePack => encode_binary(event).map(Encoded::Binary),
    }
}

/// Encode a server event as a JSON envelope.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_text(event: &ServerEvent) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a client event from a JSON envelope.
///
/// # Errors
///
/// Returns an error if the text is not a valid envelope or event.
pub fn decode_text(text: &str) -> Result<ClientEvent, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    ClientEvent::from_envelope(envelope)
}

/// Encode a server event to length-prefixed MessagePack.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the event is too large or encoding fails.
pub fn encode_binary(event: &ServerEvent) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(event, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a server event into an existing buffer.
///
/// # Errors
///
/// Returns an error if the event is too large or encoding fails.
pub fn encode_into(event: &ServerEvent, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;
    put_frame(&payload, buf)
}

/// Encode a client event to length-prefixed MessagePack.
///
/// # Errors
///
/// Returns an error if the event is too large or encoding fails.
pub fn encode_client_binary(event: &ClientEvent) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(&event.to_envelope()?)?;
    let mut buf = BytesMut::new();
    put_frame(&payload, &mut buf)?;
    Ok(buf.freeze())
}

fn put_frame(payload: &[u8], buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);

    Ok(())
}

/// Decode a client event from a complete binary frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode_binary(data: &[u8]) -> Result<ClientEvent, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let envelope: Envelope = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    ClientEvent::from_envelope(envelope)
}

/// Try to decode a client event from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(event))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<ClientEvent>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let envelope: Envelope = rmp_serde::from_slice(&payload)?;

    ClientEvent::from_envelope(envelope).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ExceptionPayload, LeaveRoom, SendMessage};
    use crate::types::{Message, RoomId};

    #[test]
    fn test_text_decode() {
        let event = decode_text(r#"{"event":"sendMessage","data":{"receiverId":"u2","text":"hi"}}"#)
            .unwrap();
        match event {
            ClientEvent::SendMessage(SendMessage {
                receiver_id, text, ..
            }) => {
                assert_eq!(receiver_id, Some("u2".into()));
                assert_eq!(text, "hi");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_text_decode_rejects_garbage() {
        assert!(matches!(decode_text("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_binary_client_event() {
        let event = ClientEvent::LeaveRoom(LeaveRoom {
            room_id: RoomId::generate(),
        });
        let encoded = encode_client_binary(&event).unwrap();
        assert_eq!(decode_binary(&encoded).unwrap(), event);
    }

    #[test]
    fn test_decode_incomplete() {
        let event = ClientEvent::GetUserList;
        let encoded = encode_client_binary(&event).unwrap();

        let partial = &encoded[..5];
        match decode_binary(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let message = Message::new(RoomId::generate(), "u1".into(), "x".repeat(MAX_FRAME_SIZE + 1));
        let event = ServerEvent::NewMessage(message);

        match encode_binary(&event) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientEvent::GetUserList;
        let second = ClientEvent::LeaveRoom(LeaveRoom {
            room_id: RoomId::generate(),
        });

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_client_binary(&first).unwrap());
        buf.extend_from_slice(&encode_client_binary(&second).unwrap());

        assert_eq!(decode_from(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
        assert_eq!(decode_from(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_encode_by_format() {
        let event = ServerEvent::Exception(ExceptionPayload::new(400, "Bad Request", "nope"));
        match encode(&event, WireFormat::Json).unwrap() {
            Encoded::Text(text) => assert!(text.contains("\"event\":\"exception\"")),
            other => panic!("expected text, got {:?}", other),
        }
        match encode(&event, WireFormat::MessagePack).unwrap() {
            Encoded::Binary(data) => {
                let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
                assert_eq!(len + LENGTH_PREFIX_SIZE, data.len());
            }
            other => panic!("expected binary, got {:?}", other),
        }
    }
}
