//! # roomcast-transport
//!
//! Connection adapter layer for the roomcast hub.
//!
//! A connection is split into two halves so that the inbound and outbound
//! pumps of a session can run independently:
//!
//! - [`FrameReader`] - blocking receive of discrete frames
//! - [`FrameWriter`] - send of frames and idempotent close
//!
//! Adapters:
//!
//! - **WebSocket** (`websocket` feature) - wraps axum's upgraded socket
//! - **Memory** (`memory` feature) - in-process pair for tests
//!
//! ```rust,ignore
//! use roomcast_transport::{FrameReader, Incoming};
//!
//! async fn drain(mut reader: impl FrameReader) {
//!     while let Ok(Some(frame)) = reader.recv().await {
//!         if let Incoming::Text(text) = frame {
//!             // decode envelope
//!         }
//!     }
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

pub use traits::{CloseFrame, FrameReader, FrameWriter, Incoming, Outgoing, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketReader, WebSocketWriter};
