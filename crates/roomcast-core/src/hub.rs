//! The hub: single coordinator for registration, membership and fan-out.
//!
//! All state (live clients and the [`RoomRegistry`]) is owned by one task.
//! Other tasks reach it only through a [`HubHandle`], which turns every
//! operation into a command on the hub's queue. Commands are applied one at
//! a time, so membership reads never interleave with a concurrent
//! registration or teardown and no locks are needed.

use crate::client::{ClientHandle, ClientId, CloseReason, Enqueue};
use crate::registry::RoomRegistry;
use roomcast_protocol::{codec, Envelope, RoomKey};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// The hub task is no longer running.
    #[error("Hub has stopped")]
    Stopped,
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Registered clients.
    pub clients: usize,
    /// Rooms with at least one member.
    pub rooms: usize,
    /// Total (room, client) memberships.
    pub memberships: usize,
    /// Broadcasts that reached a non-empty room.
    pub broadcasts: u64,
    /// Frames successfully queued for delivery.
    pub deliveries: u64,
    /// Clients evicted for overflowing their outbound queue.
    pub evictions: u64,
}

enum Command {
    Register(ClientHandle),
    Unregister(ClientId),
    Join {
        client: ClientId,
        room: RoomKey,
    },
    Leave {
        client: ClientId,
        room: RoomKey,
    },
    Broadcast(Envelope),
    Stats(oneshot::Sender<HubStats>),
    Members {
        room: RoomKey,
        reply: oneshot::Sender<Vec<ClientId>>,
    },
    RoomsOf {
        client: ClientId,
        reply: oneshot::Sender<Vec<RoomKey>>,
    },
}

/// Default number of commands the hub buffers before submitters wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Cloneable handle for submitting operations to the hub.
///
/// Submissions wait while the hub's command queue is full, so a connection
/// producing faster than the hub can fan out is slowed to the hub's pace.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<Command>,
}

impl HubHandle {
    async fn submit(&self, command: Command) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Stopped)
    }

    async fn query<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(command(reply)).await?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Admit a client into the live set.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        self.submit(Command::Register(client)).await
    }

    /// Remove a client from the live set and from every room, closing its
    /// outbound queue. Unknown clients are ignored.
    ///
    /// Does not wait: when the command queue is full the request is handed
    /// to a background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub fn unregister(&self, client: ClientId) -> Result<(), HubError> {
        match self.tx.try_send(Command::Unregister(client)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HubError::Stopped),
            Err(mpsc::error::TrySendError::Full(command)) => {
                let runtime = tokio::runtime::Handle::try_current().map_err(|_| HubError::Stopped)?;
                let tx = self.tx.clone();
                runtime.spawn(async move {
                    let _ = tx.send(command).await;
                });
                Ok(())
            }
        }
    }

    /// Add a client to a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn join_room(&self, client: ClientId, room: RoomKey) -> Result<(), HubError> {
        self.submit(Command::Join { client, room }).await
    }

    /// Remove a client from a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn leave_room(&self, client: ClientId, room: RoomKey) -> Result<(), HubError> {
        self.submit(Command::Leave { client, room }).await
    }

    /// Deliver an envelope to every current member of its room.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), HubError> {
        self.submit(Command::Broadcast(envelope)).await
    }

    /// Snapshot of hub statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.query(Command::Stats).await
    }

    /// Current members of `room`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn members(&self, room: RoomKey) -> Result<Vec<ClientId>, HubError> {
        self.query(|reply| Command::Members { room, reply }).await
    }

    /// Rooms `client` currently belongs to.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub has stopped.
    pub async fn rooms_of(&self, client: ClientId) -> Result<Vec<RoomKey>, HubError> {
        self.query(|reply| Command::RoomsOf { client, reply }).await
    }
}

/// The hub task state.
pub struct Hub {
    clients: HashMap<ClientId, ClientHandle>,
    registry: RoomRegistry,
    commands: mpsc::Receiver<Command>,
    stats: HubStats,
}

impl Hub {
    /// Create a hub and the handle used to reach it.
    #[must_use]
    pub fn new() -> (Self, HubHandle) {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a hub whose command queue holds `capacity` commands.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let hub = Self {
            clients: HashMap::new(),
            registry: RoomRegistry::new(),
            commands: rx,
            stats: HubStats::default(),
        };
        (hub, HubHandle { tx })
    }

    /// Create a hub and run it on a new task.
    #[must_use]
    pub fn spawn() -> HubHandle {
        let (hub, handle) = Self::new();
        tokio::spawn(hub.run());
        handle
    }

    /// Process commands until every [`HubHandle`] is dropped.
    ///
    /// Stopping drops all client handles, which closes every outbound queue.
    pub async fn run(mut self) {
        info!("Hub started");
        while let Some(command) = self.commands.recv().await {
            self.apply(command);
        }
        info!(clients = self.clients.len(), "Hub stopped");
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Register(client) => self.register(client),
            Command::Unregister(client) => {
                self.unregister(client, CloseReason::Normal);
            }
            Command::Join { client, room } => self.join_room(client, room),
            Command::Leave { client, room } => self.leave_room(client, &room),
            Command::Broadcast(envelope) => self.broadcast(&envelope),
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Members { room, reply } => {
                let members = self
                    .registry
                    .members(&room)
                    .map(|m| m.iter().copied().collect())
                    .unwrap_or_default();
                let _ = reply.send(members);
            }
            Command::RoomsOf { client, reply } => {
                let _ = reply.send(self.registry.rooms_of(client));
            }
        }
    }

    fn stats(&self) -> HubStats {
        HubStats {
            clients: self.clients.len(),
            rooms: self.registry.room_count(),
            memberships: self.registry.membership_count(),
            ..self.stats
        }
    }

    fn register(&mut self, client: ClientHandle) {
        let id = client.id();
        debug!(client = %id, user = client.identity().user_id, "Client connected");
        if let Some(previous) = self.clients.insert(id, client) {
            warn!(client = %id, "Duplicate registration, closing previous handle");
            previous.close(CloseReason::Normal);
        }
    }

    fn unregister(&mut self, id: ClientId, reason: CloseReason) -> bool {
        let Some(client) = self.clients.remove(&id) else {
            trace!(client = %id, "Unregister for unknown client");
            return false;
        };

        for room in self.registry.remove_client(id) {
            debug!(client = %id, room = %room, "Client left room");
        }
        client.close(reason);
        debug!(client = %id, reason = ?reason, "Client disconnected");
        true
    }

    fn join_room(&mut self, id: ClientId, room: RoomKey) {
        if !self.clients.contains_key(&id) {
            debug!(client = %id, room = %room, "Join from unregistered client ignored");
            return;
        }
        let label = room.to_string();
        if self.registry.join(room, id) {
            debug!(client = %id, room = %label, "Client joined room");
        }
    }

    fn leave_room(&mut self, id: ClientId, room: &RoomKey) {
        if self.registry.leave(room, id) {
            debug!(client = %id, room = %room, "Client left room");
        }
    }

    fn broadcast(&mut self, envelope: &Envelope) {
        let room = envelope.room_key();
        let Some(members) = self.registry.members(&room) else {
            debug!(room = %room, "Broadcast to empty room");
            return;
        };

        let frame = match codec::encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                error!(room = %room, error = %e, "Failed to encode envelope");
                return;
            }
        };

        self.stats.broadcasts += 1;
        let mut dropped = Vec::new();
        for id in members {
            let outcome = match self.clients.get(id) {
                Some(client) => client.try_enqueue(frame.clone()),
                None => Enqueue::Closed,
            };
            match outcome {
                Enqueue::Queued => self.stats.deliveries += 1,
                Enqueue::Full => dropped.push((*id, CloseReason::Evicted)),
                Enqueue::Closed => dropped.push((*id, CloseReason::Normal)),
            }
        }

        for (id, reason) in dropped {
            if reason == CloseReason::Evicted {
                self.stats.evictions += 1;
                warn!(client = %id, room = %room, "Outbound queue full, evicting client");
            }
            if !self.unregister(id, reason) {
                self.registry.remove_client(id);
            }
        }

        trace!(room = %room, members = self.registry.member_count(&room), "Broadcast delivered");
    }
}
