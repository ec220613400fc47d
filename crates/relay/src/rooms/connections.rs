use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use huddle_common::{
    protocol::ws::ServerEvent,
    types::{ConnectionId, MemberInfo, UserId},
};
use tokio::sync::mpsc;

use crate::auth::Identity;

pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;

pub struct ConnectionEntry {
    pub identity: Identity,
    pub connected_at: DateTime<Utc>,
    outbound: OutboundSender,
}

/// Live connections and their outbound queues, indexed by user.
#[derive(Default)]
pub struct ConnectionTable {
    entries: HashMap<ConnectionId, ConnectionEntry>,
    by_user: HashMap<UserId, BTreeSet<ConnectionId>>,
}

impl ConnectionTable {
    /// Registers a connection. Returns true when it is the user's first.
    pub fn insert(
        &mut self,
        connection_id: ConnectionId,
        identity: Identity,
        outbound: OutboundSender,
        connected_at: DateTime<Utc>,
    ) -> bool {
        let user_connections = self.by_user.entry(identity.user_id).or_default();
        let first = user_connections.is_empty();
        user_connections.insert(connection_id);
        self.entries.insert(connection_id, ConnectionEntry { identity, connected_at, outbound });
        first
    }

    /// Drops a connection. The flag is true when the user has none left.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<(Identity, bool)> {
        let entry = self.entries.remove(&connection_id)?;
        let user_id = entry.identity.user_id;
        let last = match self.by_user.get_mut(&user_id) {
            Some(connections) => {
                connections.remove(&connection_id);
                connections.is_empty()
            }
            None => true,
        };
        if last {
            self.by_user.remove(&user_id);
        }
        Some((entry.identity, last))
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.entries.contains_key(&connection_id)
    }

    pub fn identity(&self, connection_id: ConnectionId) -> Option<&Identity> {
        self.entries.get(&connection_id).map(|entry| &entry.identity)
    }

    pub fn user_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.identity(connection_id).map(|identity| identity.user_id)
    }

    pub fn member_info(&self, connection_id: ConnectionId) -> Option<MemberInfo> {
        self.identity(connection_id).map(|identity| MemberInfo {
            user_id: identity.user_id,
            display_name: identity.display_name.clone(),
            connection_id,
        })
    }

    pub fn connections_of(&self, user_id: UserId) -> Vec<ConnectionId> {
        self.by_user.get(&user_id).map(|set| set.iter().copied().collect()).unwrap_or_default()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.by_user.contains_key(&user_id)
    }

    /// A clone of the outbound queue, for replies produced off the core task.
    pub fn outbound(&self, connection_id: ConnectionId) -> Option<OutboundSender> {
        self.entries.get(&connection_id).map(|entry| entry.outbound.clone())
    }

    /// Queues an event for one connection. False when the socket task is gone.
    pub fn send(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        self.entries
            .get(&connection_id)
            .is_some_and(|entry| entry.outbound.send(event).is_ok())
    }

    /// Queues an event on every connection of a user.
    pub fn send_to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        self.connections_of(user_id)
            .into_iter()
            .filter(|connection_id| self.send(*connection_id, event.clone()))
            .count()
    }

    pub fn send_to_all(&self, event: &ServerEvent) -> usize {
        self.entries.values().filter(|entry| entry.outbound.send(event.clone()).is_ok()).count()
    }

    /// Connections whose socket task dropped its receiver without a disconnect.
    pub fn closed(&self) -> Vec<ConnectionId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.outbound.is_closed())
            .map(|(connection_id, _)| *connection_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
