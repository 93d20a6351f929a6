//! Room registry for roomcast.
//!
//! Plain data structure mapping room keys to member sets. It has no
//! synchronization of its own; the hub is its only owner and touches it from
//! a single task.

use crate::client::ClientId;
use roomcast_protocol::RoomKey;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// Room membership bookkeeping.
///
/// A room exists if and only if it has at least one member. The reverse
/// index (client -> rooms) obeys the same rule.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    /// Members indexed by room.
    rooms: HashMap<RoomKey, HashSet<ClientId>>,
    /// Rooms indexed by client.
    memberships: HashMap<ClientId, HashSet<RoomKey>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `client` to `room`, creating the room if needed.
    ///
    /// Returns `true` if the client was not already a member.
    pub fn join(&mut self, room: RoomKey, client: ClientId) -> bool {
        let added = self
            .memberships
            .entry(client)
            .or_default()
            .insert(room.clone());

        if added {
            let members = self.rooms.entry(room).or_insert_with_key(|key| {
                debug!(room = %key, "Creating room");
                HashSet::new()
            });
            members.insert(client);
        }

        added
    }

    /// Remove `client` from `room`, deleting the room once it is empty.
    ///
    /// Returns `true` if the client was a member.
    pub fn leave(&mut self, room: &RoomKey, client: ClientId) -> bool {
        let removed = match self.memberships.entry(client) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(room);
                if entry.get().is_empty() {
                    entry.remove();
                }
                removed
            }
            Entry::Vacant(_) => false,
        };

        if removed {
            self.remove_member(room, client);
        }

        removed
    }

    /// Remove `client` from every room it belongs to.
    ///
    /// Returns the rooms it was removed from.
    pub fn remove_client(&mut self, client: ClientId) -> Vec<RoomKey> {
        let Some(rooms) = self.memberships.remove(&client) else {
            return Vec::new();
        };

        let mut left = Vec::with_capacity(rooms.len());
        for room in rooms {
            self.remove_member(&room, client);
            left.push(room);
        }
        left
    }

    fn remove_member(&mut self, room: &RoomKey, client: ClientId) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&client);
            trace!(room = %room, client = %client, remaining = members.len(), "Member removed");
            if members.is_empty() {
                self.rooms.remove(room);
                debug!(room = %room, "Deleted empty room");
            }
        }
    }

    /// Members of `room`, or `None` if the room does not exist.
    #[must_use]
    pub fn members(&self, room: &RoomKey) -> Option<&HashSet<ClientId>> {
        self.rooms.get(room)
    }

    /// Number of members in `room`.
    #[must_use]
    pub fn member_count(&self, room: &RoomKey) -> usize {
        self.rooms.get(room).map_or(0, HashSet::len)
    }

    /// Check if `client` is a member of `room`.
    #[must_use]
    pub fn is_member(&self, room: &RoomKey, client: ClientId) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(&client))
    }

    /// Check if a room exists.
    #[must_use]
    pub fn contains_room(&self, room: &RoomKey) -> bool {
        self.rooms.contains_key(room)
    }

    /// Rooms `client` currently belongs to.
    #[must_use]
    pub fn rooms_of(&self, client: ClientId) -> Vec<RoomKey> {
        self.memberships
            .get(&client)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All existing room keys.
    pub fn rooms(&self) -> impl Iterator<Item = &RoomKey> {
        self.rooms.keys()
    }

    /// Number of rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Total number of (room, client) memberships.
    #[must_use]
    pub fn membership_count(&self) -> usize {
        self.rooms.values().map(HashSet::len).sum()
    }

    /// Check if the registry holds no rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
