//! Codec for encoding and decoding Airwave frames.
//!
//! Two encodings are supported:
//!
//! - **JSON** text, one frame per WebSocket text message (browsers).
//! - **MessagePack** with a 4-byte big-endian length prefix (binary clients).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

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

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Frame encoding negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack binary frames.
    Msgpack,
}

/// Encode a frame as JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_json<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

/// Encode a frame to length-prefixed MessagePack.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(buf.freeze())
}

/// Decode a frame from length-prefixed MessagePack.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
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

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
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
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::{ClientFrame, ServerFrame};

    #[test]
    fn test_msgpack_keeps_envelope_names() {
        let frame = ServerFrame::error(1001, "Invalid frame");
        let encoded = encode(&frame).unwrap();
        let decoded: ServerFrame = decode(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&ClientFrame::ping(Some(1))).unwrap();

        match decode::<ClientFrame>(&encoded[..5]) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_json_frame_too_large() {
        let frame = ServerFrame::error(1, "x".repeat(MAX_FRAME_SIZE + 1));

        match encode_json(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut data = vec![0u8; 8];
        data[..4].copy_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());

        assert!(matches!(
            decode::<ClientFrame>(&data),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let first = ClientFrame::reaction("u1", "fire");
        let second = ClientFrame::Sync;

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&first).unwrap());
        buf.extend_from_slice(&encode(&second).unwrap());

        // Split the second frame across two reads.
        let tail = buf.split_off(buf.len() - 2);
        assert_eq!(decode_from::<ClientFrame>(&mut buf).unwrap(), Some(first));
        assert_eq!(decode_from::<ClientFrame>(&mut buf).unwrap(), None);

        buf.extend_from_slice(&tail);
        assert_eq!(decode_from::<ClientFrame>(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(
            decode_json::<ClientFrame>("{not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_encoding_names() {
        let enc: Encoding = serde_json::from_str("\"msgpack\"").unwrap();
        assert_eq!(enc, Encoding::Msgpack);
        assert_eq!(Encoding::default(), Encoding::Json);
    }
}
