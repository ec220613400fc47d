//! Full-mesh meeting coordination.
//!
//! The coordinator only tracks who is in which mesh and decides who must be
//! told what. Ordering (joiner first, then existing peers) is enforced by the
//! gateway sending [`MeshJoin::existing`] before announcing to
//! [`MeshJoin::announce_to`].

use std::collections::HashMap;

use huddle_common::types::{ConnectionId, MeshPeer, UserId};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshJoin {
    /// Peers the joiner must offer to, in join order.
    pub existing: Vec<MeshPeer>,
    /// Peers to tell about the joiner. Empty for an idempotent re-join.
    pub announce_to: Vec<MeshPeer>,
    /// The user's previous connection, replaced by this join.
    pub replaced: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshLeave {
    pub meeting_id: String,
    pub user_id: UserId,
    /// Peers to tell about the departure.
    pub remaining: Vec<MeshPeer>,
}

#[derive(Default)]
pub struct MeshCoordinator {
    meshes: HashMap<String, Vec<MeshPeer>>,
}

impl MeshCoordinator {
    pub fn join(&mut self, meeting_id: &str, user_id: UserId, connection_id: ConnectionId) -> MeshJoin {
        let peers = self.meshes.entry(meeting_id.to_string()).or_default();
        let current = peers.iter().position(|peer| peer.user_id == user_id);

        let replaced = match current {
            Some(index) if peers[index].connection_id == connection_id => {
                let existing = peers.iter().filter(|peer| peer.user_id != user_id).copied().collect();
                return MeshJoin { existing, announce_to: Vec::new(), replaced: None };
            }
            Some(index) => Some(peers.remove(index).connection_id),
            None => None,
        };

        let existing: Vec<MeshPeer> = peers.clone();
        peers.push(MeshPeer { user_id, connection_id });
        debug!(meeting_id, user_id = %user_id, peers = peers.len(), "mesh peer joined");

        MeshJoin { announce_to: existing.clone(), existing, replaced }
    }

    /// Removes the user if `connection_id` is still their mesh connection.
    pub fn leave(
        &mut self,
        meeting_id: &str,
        user_id: UserId,
        connection_id: ConnectionId,
    ) -> Option<MeshLeave> {
        let peers = self.meshes.get_mut(meeting_id)?;
        let index = peers
            .iter()
            .position(|peer| peer.user_id == user_id && peer.connection_id == connection_id)?;
        peers.remove(index);
        let remaining = peers.clone();
        if remaining.is_empty() {
            self.meshes.remove(meeting_id);
        }
        debug!(meeting_id, user_id = %user_id, peers = remaining.len(), "mesh peer left");
        Some(MeshLeave { meeting_id: meeting_id.to_string(), user_id, remaining })
    }

    /// Removes a connection from every mesh it is in.
    pub fn leave_connection(&mut self, connection_id: ConnectionId) -> Vec<MeshLeave> {
        let mut memberships: Vec<(String, UserId)> = self
            .meshes
            .iter()
            .flat_map(|(meeting_id, peers)| {
                peers
                    .iter()
                    .filter(|peer| peer.connection_id == connection_id)
                    .map(|peer| (meeting_id.clone(), peer.user_id))
            })
            .collect();
        memberships.sort();

        memberships
            .into_iter()
            .filter_map(|(meeting_id, user_id)| self.leave(&meeting_id, user_id, connection_id))
            .collect()
    }

    pub fn peers(&self, meeting_id: &str) -> &[MeshPeer] {
        self.meshes.get(meeting_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }
}
