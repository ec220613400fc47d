// Inbound event dispatch table.
//
// Each handler validates the event against the sender's identity and room
// memberships, drives the owning component, and fans results out. A handler
// error becomes an `error` event for the sending connection only.

use chrono::{DateTime, Utc};
use huddle_common::{
    protocol::ws::{ClientEvent, ServerEvent},
    types::{CallId, CallKind, ConnectionId, DocOperation, ParticipantStatus, RoomKey, RoomKind, UserId},
};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::RealtimeCore;
use crate::{
    calls::{CallError, CallTransition},
    error::{ErrorCode, RelayError},
    merge::{MergeResult, QueuedUpdate},
    metrics,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallAction {
    Join,
    Leave,
    Reject,
    Cancel,
    End,
    Missed,
}

impl RealtimeCore {
    pub(super) fn dispatch(
        &mut self,
        connection_id: ConnectionId,
        event: ClientEvent,
        now: Instant,
        at: DateTime<Utc>,
    ) {
        let Some(user_id) = self.connections.user_of(connection_id) else {
            debug!(connection_id = %connection_id, event = event.name(), "event from unknown connection");
            return;
        };
        let started_at = std::time::Instant::now();
        let name = event.name();

        let result = match event.into_signal() {
            Ok((kind, room_key, to, body)) => self
                .signaling
                .route(&room_key, user_id, to, kind, body, &self.connections)
                .map(|_| ()),
            Err(event) => self.handle_event(connection_id, user_id, event, now, at),
        };

        let is_error = result.is_err();
        if let Err(error) = result {
            debug!(
                connection_id = %connection_id,
                user_id = %user_id,
                event = name,
                code = error.code().as_str(),
                "event rejected"
            );
            self.connections.send(connection_id, error.to_event());
        }
        metrics::record_ws_request(name, is_error, started_at.elapsed().as_millis() as u64);
    }

    fn handle_event(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        event: ClientEvent,
        now: Instant,
        at: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        match event {
            ClientEvent::JoinRoom { kind, room_id } => {
                let room_key = room_key(kind, room_id)?;
                if kind == RoomKind::Call {
                    self.authorize_call_room(&room_key, user_id)?;
                }
                self.join_room(connection_id, &room_key, at);
                Ok(())
            }
            ClientEvent::LeaveRoom { kind, room_id } => {
                let room_key = room_key(kind, room_id)?;
                self.leave_room(connection_id, user_id, &room_key, at)
            }
            ClientEvent::PresenceOnline => {
                self.set_presence(user_id, true, now, at);
                Ok(())
            }
            ClientEvent::PresenceOffline => {
                self.set_presence(user_id, false, now, at);
                Ok(())
            }
            ClientEvent::GetOnlineUsers => {
                if self.presence.allow_online_users_request(connection_id, now) {
                    let user_ids = self.presence.online_users();
                    self.connections.send(connection_id, ServerEvent::OnlineUsers { user_ids });
                } else {
                    debug!(connection_id = %connection_id, "online users request throttled");
                }
                Ok(())
            }
            ClientEvent::CallStart { callee_ids, kind } => {
                self.start_call(connection_id, user_id, &callee_ids, kind, now, at)
            }
            ClientEvent::CallJoin { call_id } => {
                self.call_action(connection_id, user_id, call_id, CallAction::Join, at)
            }
            ClientEvent::CallLeave { call_id } => {
                self.call_action(connection_id, user_id, call_id, CallAction::Leave, at)
            }
            ClientEvent::CallReject { call_id } => {
                self.call_action(connection_id, user_id, call_id, CallAction::Reject, at)
            }
            ClientEvent::CallCancel { call_id } => {
                self.call_action(connection_id, user_id, call_id, CallAction::Cancel, at)
            }
            ClientEvent::CallEnd { call_id } => {
                self.call_action(connection_id, user_id, call_id, CallAction::End, at)
            }
            ClientEvent::CallMissed { call_id } => {
                self.call_action(connection_id, user_id, call_id, CallAction::Missed, at)
            }
            ClientEvent::MeshJoin { meeting_id } => {
                self.join_mesh(connection_id, user_id, meeting_id, at)
            }
            ClientEvent::MeshLeave { meeting_id } => {
                let room_key = room_key(RoomKind::Meeting, meeting_id)?;
                self.leave_room(connection_id, user_id, &room_key, at)
            }
            ClientEvent::DocUpdate { room_key, op } => {
                self.update_document(connection_id, user_id, room_key, op, at)
            }
            ClientEvent::Typing { room_key, typing } => {
                self.require_member(&room_key, connection_id)?;
                self.rooms.broadcast(
                    &room_key,
                    &ServerEvent::UserTyping { room_key: room_key.clone(), user_id, typing },
                    Some(connection_id),
                    &self.connections,
                );
                Ok(())
            }
            ClientEvent::SdpOffer { .. } | ClientEvent::SdpAnswer { .. } | ClientEvent::IceCandidate { .. } => {
                Err(RelayError::new(ErrorCode::InternalError, "signaling event reached the wrong handler"))
            }
        }
    }

    fn leave_room(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        room_key: &RoomKey,
        at: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        if !self.rooms.leave(room_key, connection_id) {
            return Err(RelayError::new(ErrorCode::NotFound, "not a member of this room")
                .with_details(json!({ "room_key": room_key.to_string() })));
        }
        self.on_room_left(room_key, connection_id, user_id, at);
        Ok(())
    }

    fn require_member(&self, room_key: &RoomKey, connection_id: ConnectionId) -> Result<(), RelayError> {
        if self.rooms.contains(room_key, connection_id) {
            Ok(())
        } else {
            Err(RelayError::new(ErrorCode::AuthForbidden, "join the room first")
                .with_details(json!({ "room_key": room_key.to_string() })))
        }
    }

    /// Only participants of a live call may sit in its room.
    fn authorize_call_room(&self, room_key: &RoomKey, user_id: UserId) -> Result<(), RelayError> {
        let call_id = Uuid::parse_str(room_key.id()).map_err(|_| {
            RelayError::new(ErrorCode::ValidationFailed, "call room id must be a call id")
        })?;
        match self.calls.get(call_id) {
            Some(call) if call.participant(user_id).is_some() => Ok(()),
            Some(_) => Err(RelayError::new(ErrorCode::AuthForbidden, "not a participant of this call")),
            None => Err(CallError::NotFound(call_id).to_relay_error()),
        }
    }

    // ── Calls ────────────────────────────────────────────────────────

    fn start_call(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        callee_ids: &[UserId],
        kind: CallKind,
        now: Instant,
        at: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        let call = self
            .calls
            .start(user_id, callee_ids, kind, now, at)
            .map_err(|error| error.to_relay_error())?;

        self.join_room(connection_id, &call.room_key(), at);
        self.connections.send(connection_id, ServerEvent::CallStarted { call: call.clone() });
        let incoming = ServerEvent::IncomingCall { call: call.clone() };
        for participant in call.participants.iter().filter(|participant| participant.user_id != user_id) {
            let delivered = self.connections.send_to_user(participant.user_id, &incoming);
            if delivered == 0 {
                debug!(call_id = %call.call_id, callee = %participant.user_id, "callee has no open connection");
            }
        }

        let store = self.stores.calls.clone();
        crate::store::retry::spawn_persist("call.create", move || {
            let store = store.clone();
            let call = call.clone();
            async move { store.create(&call).await }
        });
        Ok(())
    }

    fn call_action(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        call_id: CallId,
        action: CallAction,
        at: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        let result = match action {
            CallAction::Join => self.calls.join(call_id, user_id, at),
            CallAction::Leave => self.calls.leave(call_id, user_id, at),
            CallAction::Reject => self.calls.reject(call_id, user_id, at),
            CallAction::Cancel => self.calls.cancel(call_id, user_id, at),
            CallAction::End => self.calls.end(call_id, user_id, at),
            CallAction::Missed => self.calls.mark_missed(call_id, Some(user_id), at),
        };
        let update = match result {
            Ok(update) => update,
            Err(CallError::NotFound(call_id)) => {
                self.report_unknown_call(connection_id, call_id);
                return Ok(());
            }
            Err(error) => return Err(error.to_relay_error()),
        };
        if action == CallAction::Leave {
            self.vacate_call_room(call_id, user_id);
        }

        if action == CallAction::Join && !matches!(update.transition, CallTransition::Terminated(_)) {
            self.join_room(connection_id, &update.snapshot.room_key(), at);
        }

        let event = match action {
            CallAction::Join => Some(ServerEvent::CallAccepted { call_id, user_id }),
            CallAction::Leave => Some(ServerEvent::CallParticipantUpdated {
                call_id,
                user_id,
                status: ParticipantStatus::Left,
            }),
            CallAction::Reject => Some(ServerEvent::CallParticipantUpdated {
                call_id,
                user_id,
                status: ParticipantStatus::Rejected,
            }),
            CallAction::Cancel | CallAction::End | CallAction::Missed => None,
        };
        self.apply_call_update(update, event);
        Ok(())
    }

    /// Removes every connection of the user from the call room without the
    /// implicit call leave a disconnect would trigger.
    fn vacate_call_room(&mut self, call_id: CallId, user_id: UserId) {
        let room_key = RoomKey::for_call(call_id);
        for connection_id in self.connections.connections_of(user_id) {
            if self.rooms.leave(&room_key, connection_id) {
                self.release_membership(&room_key, connection_id, user_id);
            }
        }
    }

    // ── Meetings ─────────────────────────────────────────────────────

    fn join_mesh(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        meeting_id: String,
        at: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        let room_key = room_key(RoomKind::Meeting, meeting_id)?;
        // Peers hear nothing about the joiner until it holds the peer list.
        let newcomer = self.enter_room(connection_id, &room_key, at);

        let meeting_id = room_key.id().to_string();
        let join = self.mesh.join(&meeting_id, user_id, connection_id);
        if let Some(replaced) = join.replaced {
            debug!(meeting_id = %meeting_id, user_id = %user_id, replaced = %replaced, "mesh connection replaced");
        }

        self.connections.send(
            connection_id,
            ServerEvent::ExistingParticipants { meeting_id: meeting_id.clone(), participants: join.existing },
        );
        if let Some(member) = newcomer {
            self.announce_member(&room_key, connection_id, member);
        }
        for peer in join.announce_to {
            self.connections.send(
                peer.connection_id,
                ServerEvent::UserJoined { meeting_id: meeting_id.clone(), user_id, connection_id },
            );
        }
        Ok(())
    }

    // ── Documents ────────────────────────────────────────────────────

    fn update_document(
        &mut self,
        connection_id: ConnectionId,
        user_id: UserId,
        room_key: RoomKey,
        op: DocOperation,
        at: DateTime<Utc>,
    ) -> Result<(), RelayError> {
        if !room_key.kind().is_collaborative() {
            return Err(RelayError::new(
                ErrorCode::ValidationFailed,
                "document updates are only accepted in document and whiteboard rooms",
            )
            .with_details(json!({ "room_key": room_key.to_string() })));
        }
        self.require_member(&room_key, connection_id)?;

        let update = QueuedUpdate { connection_id, user_id, op };
        match self.documents.merge_operation(&room_key, update, at) {
            Ok(MergeResult::Merged(outcome)) => {
                self.publish_merge(&room_key, connection_id, user_id, outcome);
            }
            Ok(MergeResult::Queued { first_request }) => {
                debug!(room_key = %room_key, "document loading, update queued");
                if first_request {
                    self.load_document(room_key);
                }
            }
            Err(error) => {
                warn!(room_key = %room_key, user_id = %user_id, error = %error, "document update refused");
                return Err(error.to_relay_error());
            }
        }
        Ok(())
    }
}

fn room_key(kind: RoomKind, room_id: String) -> Result<RoomKey, RelayError> {
    RoomKey::new(kind, room_id).map_err(|error| {
        RelayError::new(ErrorCode::ValidationFailed, error.to_string())
            .with_details(json!({ "kind": kind.as_str() }))
    })
}
