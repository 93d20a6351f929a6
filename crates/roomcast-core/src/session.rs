//! Client sessions.
//!
//! A session pairs one connection with a registered client and runs two
//! tasks:
//!
//! - the **inbound pump** reads frames, decodes envelopes and forwards
//!   join/leave/message requests to the hub;
//! - the **outbound pump** drains the client's outbound queue onto the
//!   connection and sends periodic liveness pings.
//!
//! ```text
//!                 ┌───────────────┐   join/leave/broadcast   ┌─────┐
//!  FrameReader ──▶│ inbound pump  │─────────────────────────▶│ Hub │
//!                 └───────────────┘                          └──┬──┘
//!                 ┌───────────────┐      outbound queue         │
//!  FrameWriter ◀──│ outbound pump │◀────────────────────────────┘
//!                 └───────────────┘
//! ```
//!
//! Teardown of either pump ends the other: the inbound pump unregisters the
//! client, which closes the outbound queue; the outbound pump cancels the
//! inbound pump when a write fails.

use crate::client::{ClientHandle, ClientId, Identity, OutboundQueue, DEFAULT_OUTBOUND_CAPACITY};
use crate::hub::HubHandle;
use roomcast_protocol::{Envelope, EnvelopeKind, FrameCodec, ProtocolError, RoomKey, MAX_FRAME_SIZE};
use roomcast_transport::{FrameReader, FrameWriter, Incoming, Outgoing, TransportError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time allowed to write a frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between liveness acknowledgments from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping interval. Must be less than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Session timing and sizing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-frame write deadline.
    pub write_wait: Duration,
    /// Read deadline, refreshed by every pong.
    pub pong_wait: Duration,
    /// Interval between pings.
    pub ping_period: Duration,
    /// Outbound queue capacity in frames.
    pub outbound_capacity: usize,
    /// Largest accepted inbound frame in bytes.
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Lifecycle of a session. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Created, not yet registered.
    Connecting,
    /// Registered with the hub.
    Active,
    /// A pump has failed or the hub closed the queue.
    Closing,
    /// Both pumps have exited and the connection is closed.
    Closed,
}

struct Shared {
    client: ClientId,
    state: watch::Sender<SessionState>,
    pumps: AtomicUsize,
    cancel: CancellationToken,
}

impl Shared {
    fn advance(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
    }
}

/// Marks a pump as exited, including on unwind.
struct PumpGuard(Arc<Shared>);

impl Drop for PumpGuard {
    fn drop(&mut self) {
        self.0.advance(SessionState::Closing);
        if self.0.pumps.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.advance(SessionState::Closed);
            debug!(client = %self.0.client, "Session closed");
        }
    }
}

/// Unregisters the client when dropped.
struct Registration {
    hub: HubHandle,
    client: ClientId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        // A stopped hub has already dropped every client.
        let _ = self.hub.unregister(self.client);
    }
}

/// A running client session.
pub struct Session {
    id: ClientId,
    identity: Identity,
    state: watch::Receiver<SessionState>,
}

impl Session {
    /// Admit a connection: register a new client with `hub`, join
    /// `initial_room` if given, and start both pumps.
    pub async fn spawn<R, W>(
        hub: HubHandle,
        identity: Identity,
        reader: R,
        writer: W,
        config: SessionConfig,
        initial_room: Option<RoomKey>,
    ) -> Self
    where
        R: FrameReader + 'static,
        W: FrameWriter + 'static,
    {
        let (client, queue) = ClientHandle::new(identity, config.outbound_capacity);
        let id = client.id();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let shared = Arc::new(Shared {
            client: id,
            state: state_tx,
            pumps: AtomicUsize::new(2),
            cancel: CancellationToken::new(),
        });

        let registration = Registration {
            hub: hub.clone(),
            client: id,
        };
        match hub.register(client).await {
            Ok(()) => {
                if let Some(room) = initial_room {
                    let _ = hub.join_room(id, room).await;
                }
                shared.advance(SessionState::Active);
                debug!(client = %id, user = identity.user_id, "Session active");
            }
            Err(e) => {
                // The rejected handle has been dropped, closing the queue.
                warn!(client = %id, error = %e, "Failed to register client");
                shared.cancel.cancel();
            }
        }

        tokio::spawn(inbound_pump(
            reader,
            registration,
            identity,
            FrameCodec::new(config.max_frame_size),
            config.pong_wait,
            PumpGuard(Arc::clone(&shared)),
        ));
        tokio::spawn(outbound_pump(
            writer,
            queue,
            config,
            PumpGuard(shared),
        ));

        Self {
            id,
            identity,
            state: state_rx,
        }
    }

    /// Client ID assigned at admission.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Identity attached at admission.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until both pumps have exited.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Why the inbound pump stopped.
#[derive(Debug)]
enum InboundExit {
    Cancelled,
    PeerClosed,
    ReadDeadline,
    Transport(TransportError),
    Protocol(ProtocolError),
    HubStopped,
}

async fn inbound_pump<R: FrameReader>(
    mut reader: R,
    registration: Registration,
    identity: Identity,
    codec: FrameCodec,
    pong_wait: Duration,
    guard: PumpGuard,
) {
    let shared = Arc::clone(&guard.0);
    let client = registration.client;
    let hub = registration.hub.clone();
    let mut deadline = Instant::now() + pong_wait;

    let exit = loop {
        let frame = tokio::select! {
            () = shared.cancel.cancelled() => break InboundExit::Cancelled,
            result = time::timeout_at(deadline, reader.recv()) => match result {
                Err(_) => break InboundExit::ReadDeadline,
                Ok(Err(e)) => break InboundExit::Transport(e),
                Ok(Ok(None)) => break InboundExit::PeerClosed,
                Ok(Ok(Some(frame))) => frame,
            },
        };

        let data = match &frame {
            Incoming::Pong => {
                deadline = Instant::now() + pong_wait;
                continue;
            }
            Incoming::Ping => continue,
            Incoming::Text(text) => text.as_bytes(),
            Incoming::Binary(data) => &data[..],
        };

        let envelope = match codec.decode(data) {
            Ok(envelope) => envelope,
            Err(e @ ProtocolError::FrameTooLarge { .. }) => break InboundExit::Protocol(e),
            Err(e) => {
                debug!(client = %client, error = %e, "Dropping malformed envelope");
                continue;
            }
        };

        // Waits while the hub is behind, which stops reading from the peer.
        let room = envelope.room_key();
        let submit = async {
            match envelope.kind {
                EnvelopeKind::Join => hub.join_room(client, room).await,
                EnvelopeKind::Leave => hub.leave_room(client, room).await,
                EnvelopeKind::Message => {
                    let message = Envelope::message(&room, identity.user_id, envelope.content);
                    hub.broadcast(message).await
                }
            }
        };
        tokio::select! {
            () = shared.cancel.cancelled() => break InboundExit::Cancelled,
            submitted = submit => {
                if submitted.is_err() {
                    break InboundExit::HubStopped;
                }
            }
        }
    };

    match &exit {
        InboundExit::Cancelled | InboundExit::PeerClosed => {
            debug!(client = %client, reason = ?exit, "Inbound pump stopped");
        }
        _ => warn!(client = %client, reason = ?exit, "Inbound pump failed"),
    }

    shared.advance(SessionState::Closing);
    drop(registration);
    drop(reader);
    drop(guard);
}

async fn outbound_pump<W: FrameWriter>(
    mut writer: W,
    mut queue: OutboundQueue,
    config: SessionConfig,
    guard: PumpGuard,
) {
    let shared = Arc::clone(&guard.0);
    let client = shared.client;
    let mut ticker = time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // The ticker is ready at most once per period, so polling it first
        // keeps pings flowing under a backlog without starving the queue.
        tokio::select! {
            biased;

            _ = ticker.tick() => {
                if let Err(e) = write(&mut writer, Outgoing::Ping, config.write_wait).await {
                    debug!(client = %client, error = %e, "Ping failed");
                    break;
                }
            }

            frame = queue.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write(&mut writer, Outgoing::Envelope(frame), config.write_wait).await {
                        debug!(client = %client, error = %e, "Write failed");
                        break;
                    }
                }
                None => {
                    let reason = queue.close_reason();
                    shared.advance(SessionState::Closing);
                    debug!(client = %client, reason = ?reason, "Outbound queue closed");
                    let close = Outgoing::Close(Some(reason.close_frame()));
                    let _ = write(&mut writer, close, config.write_wait).await;
                    break;
                }
            },
        }
    }

    shared.cancel.cancel();
    if let Err(e) = writer.close().await {
        debug!(client = %client, error = %e, "Close failed");
    }
    drop(guard);
}

async fn write<W: FrameWriter>(
    writer: &mut W,
    frame: Outgoing,
    deadline: Duration,
) -> Result<(), TransportError> {
    time::timeout(deadline, writer.send(frame))
        .await
        .unwrap_or(Err(TransportError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CloseReason;
    use crate::hub::Hub;
    use async_trait::async_trait;
    use roomcast_transport::memory::{self, Peer};
    use roomcast_transport::CloseFrame;

    /// Takes a second to write each envelope and answers pings at once.
    struct SlowWriter {
        peer: Peer,
        pings: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FrameWriter for SlowWriter {
        async fn send(&mut self, frame: Outgoing) -> Result<(), TransportError> {
            match frame {
                Outgoing::Envelope(_) => time::sleep(Duration::from_secs(1)).await,
                Outgoing::Ping => {
                    self.pings.fetch_add(1, Ordering::SeqCst);
                    self.peer.send_pong();
                }
                Outgoing::Close(_) => {}
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    async fn open(hub: &HubHandle, user_id: u64, room: Option<RoomKey>) -> (Session, Peer) {
        let (reader, writer, peer) = memory::pair(MAX_FRAME_SIZE);
        let session = Session::spawn(
            hub.clone(),
            Identity::new(user_id),
            reader,
            writer,
            SessionConfig::default(),
            room,
        )
        .await;
        (session, peer)
    }

    async fn next_envelope(peer: &mut Peer) -> serde_json::Value {
        loop {
            match peer.recv().await {
                Some(Outgoing::Envelope(frame)) => {
                    return serde_json::from_str(frame.as_str()).unwrap();
                }
                Some(Outgoing::Ping) => continue,
                other => panic!("expected envelope, got {:?}", other),
            }
        }
    }

    /// Wait until the hub has processed everything submitted so far.
    async fn settle(hub: &HubHandle) {
        tokio::task::yield_now().await;
        hub.stats().await.unwrap();
    }

    async fn wait_for_members(hub: &HubHandle, room: &RoomKey, count: usize) {
        while hub.members(room.clone()).await.unwrap().len() != count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_session_becomes_active() {
        let hub = Hub::spawn();
        let (session, _peer) = open(&hub, 1, None).await;

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.identity().user_id, 1);
        settle(&hub).await;
        assert_eq!(hub.stats().await.unwrap().clients, 1);
    }

    #[tokio::test]
    async fn test_message_is_stamped_by_server() {
        let hub = Hub::spawn();
        let room = RoomKey::new("dorm", "1");
        let (_a, mut peer_a) = open(&hub, 11, Some(room.clone())).await;
        let (_b, peer_b) = open(&hub, 22, Some(room.clone())).await;
        wait_for_members(&hub, &room, 2).await;

        peer_b.send_text(
            r#"{"type":"message","roomType":"dorm","roomId":"1","content":"hi",
                "userId":999,"time":"2000-01-01T00:00:00Z"}"#,
        );

        let got = next_envelope(&mut peer_a).await;
        assert_eq!(got["type"], "message");
        assert_eq!(got["userId"], 22);
        assert_eq!(got["content"], "hi");
        assert_ne!(got["time"], "2000-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn test_join_and_leave_envelopes() {
        let hub = Hub::spawn();
        let room = RoomKey::new("floor", "5");
        let (session, peer) = open(&hub, 1, None).await;

        peer.send_text(r#"{"type":"join","roomType":"floor","roomId":"5"}"#);
        wait_for_members(&hub, &room, 1).await;
        assert_eq!(hub.rooms_of(session.id()).await.unwrap(), vec![room.clone()]);

        peer.send_text(r#"{"type":"leave","roomType":"floor","roomId":"5"}"#);
        wait_for_members(&hub, &room, 0).await;
        assert_eq!(hub.stats().await.unwrap().rooms, 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let hub = Hub::spawn();
        let room = RoomKey::new("dorm", "3");
        let (session, peer) = open(&hub, 1, None).await;

        peer.send_text("not json");
        peer.send_text(r#"{"type":"dance","roomType":"dorm","roomId":"3"}"#);
        peer.send_text(r#"{"type":"join"}"#);
        peer.send_text(r#"{"type":"join","roomType":"dorm","roomId":"3"}"#);

        wait_for_members(&hub, &room, 1).await;
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_peer_close_tears_down_session() {
        let hub = Hub::spawn();
        let room = RoomKey::new("dorm", "1");
        let (session, mut peer) = open(&hub, 1, Some(room.clone())).await;
        wait_for_members(&hub, &room, 1).await;

        peer.close();
        session.closed().await;

        assert_eq!(session.state(), SessionState::Closed);
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.clients, 0);
        assert_eq!(stats.rooms, 0);
        assert_eq!(peer.recv().await, Some(Outgoing::Close(Some(CloseFrame::normal()))));
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn test_read_error_tears_down_session() {
        let hub = Hub::spawn();
        let (session, peer) = open(&hub, 1, None).await;

        peer.fail(TransportError::ReceiveFailed("reset".into()));
        session.closed().await;
        assert_eq!(hub.stats().await.unwrap().clients, 0);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_fatal() {
        let hub = Hub::spawn();
        let (session, peer) = open(&hub, 1, None).await;

        peer.send_text("x".repeat(MAX_FRAME_SIZE + 1));
        session.closed().await;
        assert_eq!(hub.stats().await.unwrap().clients, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_sent_every_period() {
        let hub = Hub::spawn();
        let (_session, mut peer) = open(&hub, 1, None).await;

        time::sleep(PING_PERIOD - Duration::from_secs(1)).await;
        assert_eq!(peer.try_recv(), None);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(peer.recv().await, Some(Outgoing::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_extends_read_deadline() {
        let hub = Hub::spawn();
        let (session, mut peer) = open(&hub, 1, None).await;

        for _ in 0..3 {
            assert_eq!(peer.recv().await, Some(Outgoing::Ping));
            peer.send_pong();
        }
        assert_eq!(session.state(), SessionState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_keep_flowing_under_backlog() {
        let hub = Hub::spawn();
        let room = RoomKey::new("dorm", "1");
        let (reader, _writer, peer) = memory::pair(MAX_FRAME_SIZE);
        let pings = Arc::new(AtomicUsize::new(0));
        let writer = SlowWriter {
            peer,
            pings: Arc::clone(&pings),
        };
        let session = Session::spawn(
            hub.clone(),
            Identity::new(1),
            reader,
            writer,
            SessionConfig::default(),
            Some(room.clone()),
        )
        .await;
        wait_for_members(&hub, &room, 1).await;

        // More than two ping periods of backlog, still under queue capacity.
        for i in 0..200 {
            hub.broadcast(Envelope::message(&room, 2, format!("#{i}"))).await.unwrap();
        }
        time::sleep(Duration::from_secs(120)).await;

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(pings.load(Ordering::SeqCst), 2);
        assert_eq!(hub.stats().await.unwrap().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_closes_session() {
        let hub = Hub::spawn();
        let (session, mut peer) = open(&hub, 1, None).await;

        session.closed().await;

        assert_eq!(peer.recv().await, Some(Outgoing::Ping));
        assert_eq!(peer.recv().await, Some(Outgoing::Close(Some(CloseFrame::normal()))));
        assert_eq!(hub.stats().await.unwrap().clients, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_hits_write_deadline() {
        let hub = Hub::spawn();
        let room = RoomKey::new("dorm", "1");
        let (reader, writer, _peer) = memory::pair_with_buffer(MAX_FRAME_SIZE, 1);
        let session = Session::spawn(
            hub.clone(),
            Identity::new(1),
            reader,
            writer,
            SessionConfig::default(),
            Some(room.clone()),
        )
        .await;
        wait_for_members(&hub, &room, 1).await;

        // The peer never reads: the first frame fills its buffer, the second blocks.
        hub.broadcast(Envelope::message(&room, 2, "one")).await.unwrap();
        hub.broadcast(Envelope::message(&room, 2, "two")).await.unwrap();

        session.closed().await;
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.clients, 0);
        assert_eq!(stats.evictions, 0);
    }

    #[tokio::test]
    async fn test_eviction_sends_reason() {
        let hub = Hub::spawn();
        let room = RoomKey::new("dorm", "1");
        let config = SessionConfig {
            outbound_capacity: 2,
            ..SessionConfig::default()
        };
        // The peer buffer holds one frame, so the outbound pump stalls and the
        // queue overflows.
        let (reader, writer, mut peer) = memory::pair_with_buffer(MAX_FRAME_SIZE, 1);
        let session = Session::spawn(
            hub.clone(),
            Identity::new(1),
            reader,
            writer,
            config,
            Some(room.clone()),
        )
        .await;
        wait_for_members(&hub, &room, 1).await;

        for i in 0..6 {
            hub.broadcast(Envelope::message(&room, 2, format!("#{i}"))).await.unwrap();
        }
        settle(&hub).await;
        assert_eq!(hub.stats().await.unwrap().evictions, 1);

        let mut close = None;
        while let Some(frame) = peer.recv().await {
            if let Outgoing::Close(frame) = frame {
                close = frame;
            }
        }
        session.closed().await;
        assert_eq!(close, Some(CloseReason::Evicted.close_frame()));
    }

    #[tokio::test]
    async fn test_stopped_hub_closes_session() {
        let (hub, handle) = Hub::new();
        let task = tokio::spawn(hub.run());
        let (session, _peer) = open(&handle, 1, None).await;
        settle(&handle).await;

        // Sessions keep handles alive, so stop the hub task directly.
        task.abort();
        session.closed().await;
    }
}
