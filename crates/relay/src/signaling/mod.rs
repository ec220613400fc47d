//! Point-to-point relay of WebRTC handshake payloads.
//!
//! Each call or meeting room keeps a `user_id -> connection_id` index. A
//! signal reaches exactly the indexed connection of its target, or nobody.

use std::collections::HashMap;

use huddle_common::{
    protocol::ws::ServerEvent,
    types::{ConnectionId, RoomKey, SignalKind, UserId},
};
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::{ErrorCode, RelayError},
    metrics,
    rooms::ConnectionTable,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered(ConnectionId),
    /// Target not indexed in the room, or its socket is gone. Nothing is sent
    /// back to the sender.
    PeerUnavailable,
}

#[derive(Default)]
pub struct SignalingRelay {
    index: HashMap<RoomKey, HashMap<UserId, ConnectionId>>,
}

impl SignalingRelay {
    /// Indexes the user's connection in the room. A newer connection of the
    /// same user takes over.
    pub fn register(&mut self, room_key: &RoomKey, user_id: UserId, connection_id: ConnectionId) {
        if !room_key.kind().supports_signaling() {
            return;
        }
        self.index.entry(room_key.clone()).or_default().insert(user_id, connection_id);
    }

    /// Drops the entry if it still points at `connection_id`.
    pub fn unregister(&mut self, room_key: &RoomKey, user_id: UserId, connection_id: ConnectionId) {
        let Some(peers) = self.index.get_mut(room_key) else {
            return;
        };
        if peers.get(&user_id) == Some(&connection_id) {
            peers.remove(&user_id);
        }
        if peers.is_empty() {
            self.index.remove(room_key);
        }
    }

    pub fn lookup(&self, room_key: &RoomKey, user_id: UserId) -> Option<ConnectionId> {
        self.index.get(room_key).and_then(|peers| peers.get(&user_id)).copied()
    }

    pub fn room_count(&self) -> usize {
        self.index.len()
    }

    /// Forwards `body` from `from` to `to` inside `room_key`.
    pub fn route(
        &self,
        room_key: &RoomKey,
        from: UserId,
        to: UserId,
        kind: SignalKind,
        body: Value,
        connections: &ConnectionTable,
    ) -> Result<RouteOutcome, RelayError> {
        if !room_key.kind().supports_signaling() {
            return Err(RelayError::new(
                ErrorCode::ValidationFailed,
                "signaling is only available in call and meeting rooms",
            )
            .with_details(json!({ "room_key": room_key.to_string() })));
        }
        if self.lookup(room_key, from).is_none() {
            return Err(RelayError::new(
                ErrorCode::AuthForbidden,
                "join the room before sending signaling messages",
            )
            .with_details(json!({ "room_key": room_key.to_string() })));
        }

        let Some(target) = self.lookup(room_key, to) else {
            debug!(room_key = %room_key, from = %from, to = %to, kind = kind.as_str(), "signal target not in room");
            metrics::record_signal(false);
            return Ok(RouteOutcome::PeerUnavailable);
        };

        let delivered =
            connections.send(target, ServerEvent::signal(kind, room_key.clone(), from, body));
        metrics::record_signal(delivered);
        if delivered {
            Ok(RouteOutcome::Delivered(target))
        } else {
            debug!(room_key = %room_key, to = %to, connection_id = %target, "signal target socket closed");
            Ok(RouteOutcome::PeerUnavailable)
        }
    }
}
