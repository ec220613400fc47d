//! Room registry: which connections share which real-time topic.
//!
//! A connection holds at most one room per [`RoomKind`]. Joining a second
//! room of the same kind leaves the first, and a room that loses its last
//! member is dropped on the spot.

pub mod connections;

use std::collections::{BTreeSet, HashMap};

use huddle_common::{
    protocol::ws::ServerEvent,
    types::{ConnectionId, RoomKey, RoomKind},
};

pub use connections::{ConnectionTable, OutboundSender};

/// What a [`RoomRegistry::join`] changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// False when the connection was already a member.
    pub newly_joined: bool,
    /// Room of the same kind the connection was implicitly removed from.
    pub left: Option<RoomKey>,
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: HashMap<RoomKey, BTreeSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, HashMap<RoomKind, RoomKey>>,
}

impl RoomRegistry {
    pub fn join(&mut self, room_key: &RoomKey, connection_id: ConnectionId) -> JoinOutcome {
        let current = self
            .memberships
            .get(&connection_id)
            .and_then(|rooms| rooms.get(&room_key.kind()))
            .cloned();
        if current.as_ref() == Some(room_key) {
            return JoinOutcome { newly_joined: false, left: None };
        }

        let left = current.filter(|previous| self.leave(previous, connection_id));
        self.rooms.entry(room_key.clone()).or_default().insert(connection_id);
        self.memberships
            .entry(connection_id)
            .or_default()
            .insert(room_key.kind(), room_key.clone());

        JoinOutcome { newly_joined: true, left }
    }

    /// Removes the membership. Returns false when there was none.
    pub fn leave(&mut self, room_key: &RoomKey, connection_id: ConnectionId) -> bool {
        let Some(members) = self.rooms.get_mut(room_key) else {
            return false;
        };
        if !members.remove(&connection_id) {
            return false;
        }
        if members.is_empty() {
            self.rooms.remove(room_key);
        }

        if let Some(rooms) = self.memberships.get_mut(&connection_id) {
            if rooms.get(&room_key.kind()) == Some(room_key) {
                rooms.remove(&room_key.kind());
            }
            if rooms.is_empty() {
                self.memberships.remove(&connection_id);
            }
        }
        true
    }

    /// Releases every membership of a connection, returning the rooms left.
    pub fn leave_all(&mut self, connection_id: ConnectionId) -> Vec<RoomKey> {
        let mut left = self.rooms_of(connection_id);
        left.retain(|room_key| self.leave(room_key, connection_id));
        left
    }

    pub fn members_of(&self, room_key: &RoomKey) -> Vec<ConnectionId> {
        self.rooms.get(room_key).map(|members| members.iter().copied().collect()).unwrap_or_default()
    }

    pub fn contains(&self, room_key: &RoomKey, connection_id: ConnectionId) -> bool {
        self.rooms.get(room_key).is_some_and(|members| members.contains(&connection_id))
    }

    pub fn room_of(&self, connection_id: ConnectionId, kind: RoomKind) -> Option<&RoomKey> {
        self.memberships.get(&connection_id).and_then(|rooms| rooms.get(&kind))
    }

    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<RoomKey> {
        let mut rooms: Vec<RoomKey> = self
            .memberships
            .get(&connection_id)
            .map(|rooms| rooms.values().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Drops rooms without members. Leave already does this, so a non-zero
    /// result points at a bookkeeping bug elsewhere.
    pub fn prune_empty(&mut self) -> usize {
        let before = self.rooms.len();
        self.rooms.retain(|_, members| !members.is_empty());
        before - self.rooms.len()
    }

    /// Sends `event` to every member except `excluding`, returning how many
    /// outbound queues accepted it.
    pub fn broadcast(
        &self,
        room_key: &RoomKey,
        event: &ServerEvent,
        excluding: Option<ConnectionId>,
        connections: &ConnectionTable,
    ) -> usize {
        let Some(members) = self.rooms.get(room_key) else {
            return 0;
        };
        members
            .iter()
            .filter(|connection_id| Some(**connection_id) != excluding)
            .filter(|connection_id| connections.send(**connection_id, event.clone()))
            .count()
    }
}
