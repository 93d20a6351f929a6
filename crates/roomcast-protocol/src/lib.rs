//! # roomcast-protocol
//!
//! Wire protocol definitions for the roomcast multicast hub.
//!
//! Every frame exchanged over a connection is a single JSON object, the
//! *envelope*. Clients send [`InboundEnvelope`]s; the server only emits
//! [`Envelope`]s, stamping `userId` and `time` itself.
//!
//! ## Envelope Kinds
//!
//! - `join` / `leave` - Room membership
//! - `message` - Broadcast a body to every member of a room
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, EnvelopeKind};
//!
//! let inbound = codec::decode(br#"{"type":"join","roomType":"dorm","roomId":"1"}"#).unwrap();
//! assert_eq!(inbound.kind, EnvelopeKind::Join);
//! assert_eq!(inbound.room_key().to_string(), "dorm:1");
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, FrameCodec, ProtocolError, MAX_FRAME_SIZE};
pub use envelope::{EncodedEnvelope, Envelope, EnvelopeKind, InboundEnvelope, RoomKey, UserId};
