//! In-memory transport.
//!
//! Produces a connected reader/writer pair plus a [`Peer`] handle that plays
//! the remote side. The peer can inject frames, observe what the server
//! writes, or simply stop reading to simulate a stalled client.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::traits::{check_frame_size, FrameReader, FrameWriter, Incoming, Outgoing, TransportError};

/// Default number of outgoing frames buffered before the writer blocks.
pub const DEFAULT_PEER_BUFFER: usize = 64;

enum PeerEvent {
    Frame(Incoming),
    Close,
    Fail(TransportError),
}

/// Create a connected in-memory pair.
#[must_use]
pub fn pair(max_frame_size: usize) -> (MemoryReader, MemoryWriter, Peer) {
    pair_with_buffer(max_frame_size, DEFAULT_PEER_BUFFER)
}

/// Create a connected in-memory pair whose writer blocks once `buffer`
/// frames are waiting for the peer.
#[must_use]
pub fn pair_with_buffer(max_frame_size: usize, buffer: usize) -> (MemoryReader, MemoryWriter, Peer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::channel(buffer.max(1));

    (
        MemoryReader {
            rx: in_rx,
            max_frame_size,
        },
        MemoryWriter { tx: Some(out_tx) },
        Peer {
            tx: in_tx,
            rx: out_rx,
        },
    )
}

/// Receiving half of an in-memory connection.
pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<PeerEvent>,
    max_frame_size: usize,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Incoming>, TransportError> {
        match self.rx.recv().await {
            Some(PeerEvent::Frame(frame)) => {
                check_frame_size(&frame, self.max_frame_size)?;
                Ok(Some(frame))
            }
            Some(PeerEvent::Fail(e)) => Err(e),
            Some(PeerEvent::Close) | None => Ok(None),
        }
    }
}

/// Sending half of an in-memory connection.
pub struct MemoryWriter {
    tx: Option<mpsc::Sender<Outgoing>>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn send(&mut self, frame: Outgoing) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.tx.is_some()
    }
}

/// The remote end of an in-memory connection.
pub struct Peer {
    tx: mpsc::UnboundedSender<PeerEvent>,
    rx: mpsc::Receiver<Outgoing>,
}

impl Peer {
    /// Send a frame to the server side. Returns `false` once the reader is gone.
    pub fn send(&self, frame: Incoming) -> bool {
        self.tx.send(PeerEvent::Frame(frame)).is_ok()
    }

    /// Send a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.send(Incoming::Text(text.into()))
    }

    /// Acknowledge a liveness ping.
    pub fn send_pong(&self) -> bool {
        self.send(Incoming::Pong)
    }

    /// Close the connection from the peer side.
    pub fn close(&self) -> bool {
        self.tx.send(PeerEvent::Close).is_ok()
    }

    /// Make the server's next read fail with `error`.
    pub fn fail(&self, error: TransportError) -> bool {
        self.tx.send(PeerEvent::Fail(error)).is_ok()
    }

    /// Receive the next frame written by the server.
    ///
    /// Returns `None` once the writer is closed and drained.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        self.rx.recv().await
    }

    /// Receive a frame if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Outgoing> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_protocol::EncodedEnvelope;

    #[tokio::test]
    async fn test_peer_frames_reach_reader() {
        let (mut reader, _writer, peer) = pair(512);

        assert!(peer.send_text("hello"));
        assert!(peer.send_pong());
        assert!(peer.close());

        assert_eq!(reader.recv().await.unwrap(), Some(Incoming::Text("hello".into())));
        assert_eq!(reader.recv().await.unwrap(), Some(Incoming::Pong));
        assert_eq!(reader.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_rejects_large_frames() {
        let (mut reader, _writer, peer) = pair(4);
        peer.send_text("too long");

        assert!(matches!(
            reader.recv().await,
            Err(TransportError::FrameTooLarge { size: 8, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_writer_close_is_idempotent() {
        let (_reader, mut writer, mut peer) = pair(512);

        let frame = Outgoing::Envelope(EncodedEnvelope::from(String::from("{}")));
        writer.send(frame.clone()).await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();

        assert!(!writer.is_open());
        assert!(matches!(
            writer.send(Outgoing::Ping).await,
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(peer.recv().await, Some(frame));
        assert_eq!(peer.recv().await, None);
    }
}
