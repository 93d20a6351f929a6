//! # roomcast-core
//!
//! Room membership, fan-out, and per-connection sessions for the roomcast hub.
//!
//! - **Registry** - room key to member set, with a reverse index per client
//! - **Hub** - single task owning every client and the registry
//! - **Client** - identity plus a bounded outbound queue
//! - **Session** - inbound and outbound pumps bound to one connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  commands   ┌─────────────┐     ┌─────────────┐
//! │   Session   │────────────▶│     Hub     │────▶│  Registry   │
//! └─────────────┘             └─────────────┘     └─────────────┘
//!        ▲                           │
//!        │      outbound queue       │
//!        └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use roomcast_core::{ClientHandle, Envelope, Hub, Identity, RoomKey};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let hub = Hub::spawn();
//! let room = RoomKey::new("dorm", "12");
//!
//! let (client, mut queue) = ClientHandle::new(Identity::new(7), 16);
//! let id = client.id();
//! hub.register(client).await.unwrap();
//! hub.join_room(id, room.clone()).await.unwrap();
//! hub.broadcast(Envelope::message(&room, 7, "hello")).await.unwrap();
//!
//! let frame = queue.recv().await.unwrap();
//! assert!(frame.as_str().contains("\"content\":\"hello\""));
//! # }
//! ```

pub mod client;
pub mod hub;
pub mod registry;
pub mod session;

pub use client::{ClientHandle, ClientId, CloseReason, Enqueue, Identity, OutboundQueue};
pub use hub::{Hub, HubError, HubHandle, HubStats};
pub use registry::RoomRegistry;
pub use roomcast_protocol::{Envelope, RoomKey, UserId};
pub use session::{Session, SessionConfig, SessionState};
