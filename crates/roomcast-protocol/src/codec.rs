//! Codec for encoding and decoding roomcast envelopes.
//!
//! Envelopes travel as JSON text, one envelope per transport frame. Decoding
//! is total: any byte sequence yields either an envelope or a
//! [`ProtocolError`], never a panic.

use thiserror::Error;

use crate::envelope::{EncodedEnvelope, Envelope, InboundEnvelope};

/// Maximum inbound frame size in bytes.
pub const MAX_FRAME_SIZE: usize = 512;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// JSON decoding error, including unknown envelope types.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),

    /// A required field was absent or empty.
    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

/// Encode an envelope to its wire form.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<EncodedEnvelope, ProtocolError> {
    serde_json::to_string(envelope)
        .map(EncodedEnvelope::from)
        .map_err(ProtocolError::Encode)
}

/// Decode an inbound envelope, enforcing [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns an error if the frame is too large, is not a valid envelope, or
/// does not name a room.
pub fn decode(data: &[u8]) -> Result<InboundEnvelope, ProtocolError> {
    FrameCodec::default().decode(data)
}

/// Codec with a configurable inbound size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec that rejects inbound frames above `max_frame_size`.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode an inbound envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is too large or invalid.
    pub fn decode(&self, data: &[u8]) -> Result<InboundEnvelope, ProtocolError> {
        if data.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                max: self.max_frame_size,
            });
        }

        let envelope: InboundEnvelope =
            serde_json::from_slice(data).map_err(ProtocolError::Decode)?;

        if envelope.room_type.is_empty() {
            return Err(ProtocolError::MissingField("roomType"));
        }
        if envelope.room_id.is_empty() {
            return Err(ProtocolError::MissingField("roomId"));
        }

        Ok(envelope)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeKind, RoomKey};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    #[test]
    fn test_decode_join() {
        let envelope = decode(br#"{"type":"join","roomType":"dorm","roomId":"1"}"#).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Join);
        assert_eq!(envelope.room_key(), RoomKey::new("dorm", "1"));
        assert!(envelope.content.is_empty());
    }

    #[test]
    fn test_decode_ignores_client_identity_and_time() {
        let data = br#"{"type":"message","roomType":"floor","roomId":"5",
            "userId":999,"time":"1999-01-01T00:00:00Z","content":"hey","extra":true}"#;
        let envelope = decode(data).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Message);
        assert_eq!(envelope.content, "hey");
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let result = decode(br#"{"type":"shout","roomType":"dorm","roomId":"1"}"#);
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        assert!(matches!(decode(b"{not json"), Err(ProtocolError::Decode(_))));
        assert!(matches!(decode(b""), Err(ProtocolError::Decode(_))));
        assert!(matches!(decode(&[0xff, 0xfe, 0x00]), Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_requires_room() {
        assert!(matches!(
            decode(br#"{"type":"join","roomId":"1"}"#),
            Err(ProtocolError::MissingField("roomType"))
        ));
        assert!(matches!(
            decode(br#"{"type":"join","roomType":"dorm","roomId":""}"#),
            Err(ProtocolError::MissingField("roomId"))
        ));
    }

    #[test]
    fn test_decode_frame_too_large() {
        let content = "x".repeat(MAX_FRAME_SIZE);
        let data = format!(r#"{{"type":"message","roomType":"dorm","roomId":"1","content":"{content}"}}"#);

        match decode(data.as_bytes()) {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!(size, data.len());
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }

        // A larger codec limit accepts the same frame.
        assert!(FrameCodec::new(4096).decode(data.as_bytes()).is_ok());
    }

    #[test]
    fn test_encode_wire_field_names() {
        let time = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let envelope = Envelope::message_at(&RoomKey::new("dorm", "1"), 7, "hi", time);
        let encoded = encode(&envelope).unwrap();

        let value: serde_json::Value = serde_json::from_str(encoded.as_str()).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["roomType"], "dorm");
        assert_eq!(value["roomId"], "1");
        assert_eq!(value["userId"], 7);
        assert_eq!(value["content"], "hi");
        assert_eq!(value["time"], "2024-05-01T12:30:00Z");
    }

    proptest! {
        #[test]
        fn prop_decode_is_total(data in proptest::collection::vec(any::<u8>(), 0..1024)) {
            let _ = decode(&data);
        }
    }
}
