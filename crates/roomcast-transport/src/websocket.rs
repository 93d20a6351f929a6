//! WebSocket transport implementation.
//!
//! This module adapts an upgraded axum [`WebSocket`] to the
//! [`FrameReader`]/[`FrameWriter`] pair used by the session pumps.

use async_trait::async_trait;
use axum::extract::ws::{self, Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::error::{CapacityError, Error as WsError};
use tracing::{debug, warn};

use crate::traits::{check_frame_size, FrameReader, FrameWriter, Incoming, Outgoing, TransportError};

/// Split an upgraded socket into reader and writer halves.
///
/// Frames above `max_frame_size` bytes are reported as
/// [`TransportError::FrameTooLarge`].
#[must_use]
pub fn split(socket: WebSocket, max_frame_size: usize) -> (WebSocketReader, WebSocketWriter) {
    let (sink, stream) = socket.split();
    (
        WebSocketReader {
            stream,
            max_frame_size,
        },
        WebSocketWriter {
            sink,
            is_open: true,
        },
    )
}

/// Receiving half of a WebSocket connection.
pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
    max_frame_size: usize,
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        let frame = match self.stream.next().await {
            Some(Ok(Message::Text(text))) => Incoming::Text(text),
            Some(Ok(Message::Binary(data))) => Incoming::Binary(Bytes::from(data)),
            // Pongs to peer pings are queued by the websocket library itself.
            Some(Ok(Message::Ping(_))) => Incoming::Ping,
            Some(Ok(Message::Pong(_))) => Incoming::Pong,
            Some(Ok(Message::Close(frame))) => {
                debug!(code = ?frame.as_ref().map(|f| f.code), "Received close frame");
                return Ok(None);
            }
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket error");
                return Err(receive_error(e));
            }
            None => {
                debug!("WebSocket stream ended");
                return Ok(None);
            }
        };

        check_frame_size(&frame, self.max_frame_size)?;
        Ok(Some(frame))
    }
}

/// Map a socket read error, keeping the library's size limit distinct.
fn receive_error(err: axum::Error) -> TransportError {
    let inner = err.into_inner();
    match inner.downcast_ref::<WsError>() {
        Some(WsError::Capacity(CapacityError::MessageTooLong { size, max_size })) => {
            TransportError::FrameTooLarge {
                size: *size,
                max: *max_size,
            }
        }
        _ => TransportError::ReceiveFailed(inner.to_string()),
    }
}

/// Sending half of a WebSocket connection.
pub struct WebSocketWriter {
    sink: SplitSink<WebSocket, Message>,
    is_open: bool,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn send(&mut self, frame: Outgoing) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            Outgoing::Envelope(envelope) => Message::Text(envelope.as_str().to_owned()),
            Outgoing::Ping => Message::Ping(Vec::new()),
            Outgoing::Close(frame) => Message::Close(frame.map(|f| ws::CloseFrame {
                code: f.code,
                reason: f.reason,
            })),
        };

        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
