//! Connection adapter traits for roomcast.
//!
//! These traits define the interface every transport must provide, keeping
//! the session pumps transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use roomcast_protocol::EncodedEnvelope;
use std::borrow::Cow;
use thiserror::Error;

/// A frame received from the peer. A close frame is not a variant: the
/// reader reports it, like end of stream, as `Ok(None)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Text frame, expected to carry an envelope.
    Text(String),
    /// Binary frame, decoded the same way as text.
    Binary(Bytes),
    /// Liveness ping from the peer.
    Ping,
    /// Liveness acknowledgment from the peer.
    Pong,
}

impl Incoming {
    /// Payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Incoming::Text(text) => text.len(),
            Incoming::Binary(data) => data.len(),
            Incoming::Ping | Incoming::Pong => 0,
        }
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Close frame sent to the peer before a connection is torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// WebSocket close code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: Cow<'static, str>,
}

impl CloseFrame {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Policy violation.
    pub const POLICY: u16 = 1008;

    /// Create a close frame.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal closure with no reason.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(Self::NORMAL, "")
    }
}

/// A frame to write to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// An encoded envelope.
    Envelope(EncodedEnvelope),
    /// Liveness ping.
    Ping,
    /// Close handshake.
    Close(Option<CloseFrame>),
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A deadline elapsed.
    #[error("Connection timed out")]
    Timeout,

    /// Inbound frame exceeded the size limit.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Reject frames above `max` bytes.
pub(crate) fn check_frame_size(frame: &Incoming, max: usize) -> Result<(), TransportError> {
    let size = frame.len();
    if size > max {
        tracing::warn!(size, max, "Inbound frame too large");
        return Err(TransportError::FrameTooLarge { size, max });
    }
    Ok(())
}

/// Receiving half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` once the peer has closed the connection cleanly.
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError>;
}

/// Sending half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Write a frame.
    async fn send(&mut self, frame: Outgoing) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the connection is still open for writing.
    fn is_open(&self) -> bool;
}
