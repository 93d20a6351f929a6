//! Client identity and outbound queue.
//!
//! A client is split in two at admission: the [`ClientHandle`] is handed to
//! the hub and holds the only sender of the bounded outbound queue, while the
//! [`OutboundQueue`] stays with the session's outbound pump. Dropping or
//! closing the handle therefore closes the queue.

use roomcast_protocol::{EncodedEnvelope, UserId};
use roomcast_transport::CloseFrame;
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Default outbound queue capacity, in frames.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Unique identifier for a client, generated at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generate a random client ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Verified identity attached to a client at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Authenticated user.
    pub user_id: UserId,
}

impl Identity {
    /// Create an identity for `user_id`.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

/// Why the hub closed a client's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Regular teardown.
    Normal,
    /// The client could not keep up with its outbound queue.
    Evicted,
}

impl CloseReason {
    /// The close frame announcing this reason to the peer.
    #[must_use]
    pub fn close_frame(self) -> CloseFrame {
        match self {
            CloseReason::Normal => CloseFrame::normal(),
            CloseReason::Evicted => CloseFrame::new(CloseFrame::POLICY, "outbound queue overflow"),
        }
    }
}

/// Outcome of offering a frame to a client's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// The frame was queued.
    Queued,
    /// The queue is at capacity.
    Full,
    /// The outbound pump is gone.
    Closed,
}

/// Hub-owned half of a client.
#[derive(Debug)]
pub struct ClientHandle {
    id: ClientId,
    identity: Identity,
    outbound: mpsc::Sender<EncodedEnvelope>,
    close_reason: oneshot::Sender<CloseReason>,
}

impl ClientHandle {
    /// Create a client with a fresh ID and an outbound queue of `capacity`
    /// frames.
    #[must_use]
    pub fn new(identity: Identity, capacity: usize) -> (Self, OutboundQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (reason_tx, reason_rx) = oneshot::channel();

        let handle = Self {
            id: ClientId::generate(),
            identity,
            outbound: tx,
            close_reason: reason_tx,
        };
        let queue = OutboundQueue {
            rx,
            close_reason: reason_rx,
        };
        (handle, queue)
    }

    /// Client ID.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Verified identity.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Offer a frame without waiting.
    pub fn try_enqueue(&self, frame: EncodedEnvelope) -> Enqueue {
        match self.outbound.try_send(frame) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => Enqueue::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Close the outbound queue, recording `reason` for the outbound pump.
    ///
    /// Frames already queued are still delivered.
    pub fn close(self, reason: CloseReason) {
        // The pump may already be gone.
        let _ = self.close_reason.send(reason);
    }
}

/// Session-owned half of a client: the receiving end of its outbound queue.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<EncodedEnvelope>,
    close_reason: oneshot::Receiver<CloseReason>,
}

impl OutboundQueue {
    /// Wait for the next frame.
    ///
    /// Returns `None` once the hub has closed the queue and it is drained.
    pub async fn recv(&mut self) -> Option<EncodedEnvelope> {
        self.rx.recv().await
    }

    /// Take the next frame if one is queued.
    pub fn try_recv(&mut self) -> Option<EncodedEnvelope> {
        self.rx.try_recv().ok()
    }

    /// Number of frames waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check if no frames are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Why the queue was closed. Meaningful once [`recv`](Self::recv) has
    /// returned `None`; defaults to [`CloseReason::Normal`].
    pub fn close_reason(&mut self) -> CloseReason {
        self.close_reason.try_recv().unwrap_or(CloseReason::Normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> EncodedEnvelope {
        EncodedEnvelope::from(text.to_string())
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(ClientId::generate(), ClientId::generate());
    }

    #[test]
    fn test_enqueue_until_full() {
        let (client, mut queue) = ClientHandle::new(Identity::new(1), 2);

        assert_eq!(client.try_enqueue(frame("a")), Enqueue::Queued);
        assert_eq!(client.try_enqueue(frame("b")), Enqueue::Queued);
        assert_eq!(client.try_enqueue(frame("c")), Enqueue::Full);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.try_recv(), Some(frame("a")));
        assert_eq!(client.try_enqueue(frame("c")), Enqueue::Queued);
    }

    #[test]
    fn test_enqueue_after_pump_exit() {
        let (client, queue) = ClientHandle::new(Identity::new(1), 2);
        drop(queue);
        assert_eq!(client.try_enqueue(frame("a")), Enqueue::Closed);
    }

    #[tokio::test]
    async fn test_close_drains_then_reports_reason() {
        let (client, mut queue) = ClientHandle::new(Identity::new(1), 4);
        client.try_enqueue(frame("a"));
        client.close(CloseReason::Evicted);

        assert_eq!(queue.recv().await, Some(frame("a")));
        assert_eq!(queue.recv().await, None);
        assert_eq!(queue.close_reason(), CloseReason::Evicted);
    }

    #[tokio::test]
    async fn test_dropped_handle_reports_normal() {
        let (client, mut queue) = ClientHandle::new(Identity::new(1), 4);
        drop(client);

        assert_eq!(queue.recv().await, None);
        assert_eq!(queue.close_reason(), CloseReason::Normal);
    }

    #[test]
    fn test_close_frames() {
        assert_eq!(CloseReason::Normal.close_frame().code, CloseFrame::NORMAL);
        assert_eq!(CloseReason::Evicted.close_frame().code, CloseFrame::POLICY);
    }
}
