// WebSocket event types for the huddle-rt.v1 protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    CallEndReason, CallId, CallKind, CallSnapshot, CallStatus, ConnectionId, DocOperation,
    DocumentSnapshot, MemberInfo, MeshPeer, ParticipantStatus, RoomKey, RoomKind, SignalKind,
    UserId,
};

/// The protocol version spoken by this build.
pub const CURRENT_PROTOCOL_VERSION: &str = "huddle-rt.v1";

/// Every protocol version the relay accepts, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[CURRENT_PROTOCOL_VERSION];

/// Client -> Server events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join a room, leaving any other room of the same kind.
    JoinRoom { kind: RoomKind, room_id: String },
    LeaveRoom { kind: RoomKind, room_id: String },

    PresenceOnline,
    PresenceOffline,
    GetOnlineUsers,

    CallStart { callee_ids: Vec<UserId>, kind: CallKind },
    CallJoin { call_id: CallId },
    CallLeave { call_id: CallId },
    CallReject { call_id: CallId },
    CallCancel { call_id: CallId },
    CallEnd { call_id: CallId },
    /// The caller's client gave up ringing before the relay's own timeout.
    CallMissed { call_id: CallId },

    SdpOffer { room_key: RoomKey, to: UserId, body: Value },
    SdpAnswer { room_key: RoomKey, to: UserId, body: Value },
    IceCandidate { room_key: RoomKey, to: UserId, body: Value },

    MeshJoin { meeting_id: String },
    MeshLeave { meeting_id: String },

    DocUpdate { room_key: RoomKey, op: DocOperation },
    Typing { room_key: RoomKey, typing: bool },
}

impl ClientEvent {
    /// Stable event name, used for logging and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join_room",
            Self::LeaveRoom { .. } => "leave_room",
            Self::PresenceOnline => "presence_online",
            Self::PresenceOffline => "presence_offline",
            Self::GetOnlineUsers => "get_online_users",
            Self::CallStart { .. } => "call_start",
            Self::CallJoin { .. } => "call_join",
            Self::CallLeave { .. } => "call_leave",
            Self::CallReject { .. } => "call_reject",
            Self::CallCancel { .. } => "call_cancel",
            Self::CallEnd { .. } => "call_end",
            Self::CallMissed { .. } => "call_missed",
            Self::SdpOffer { .. } => "sdp_offer",
            Self::SdpAnswer { .. } => "sdp_answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::MeshJoin { .. } => "mesh_join",
            Self::MeshLeave { .. } => "mesh_leave",
            Self::DocUpdate { .. } => "doc_update",
            Self::Typing { .. } => "typing",
        }
    }

    /// Splits a signaling event into its parts, handing every other event
    /// back unchanged.
    pub fn into_signal(self) -> Result<(SignalKind, RoomKey, UserId, Value), Self> {
        match self {
            Self::SdpOffer { room_key, to, body } => Ok((SignalKind::SdpOffer, room_key, to, body)),
            Self::SdpAnswer { room_key, to, body } => {
                Ok((SignalKind::SdpAnswer, room_key, to, body))
            }
            Self::IceCandidate { room_key, to, body } => {
                Ok((SignalKind::IceCandidate, room_key, to, body))
            }
            other => Err(other),
        }
    }
}

/// Server -> Client events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// First event on every connection.
    Connected {
        connection_id: ConnectionId,
        user_id: UserId,
        display_name: String,
        protocol_version: String,
        server_time: DateTime<Utc>,
        heartbeat_interval_ms: u64,
        max_frame_bytes: usize,
    },

    /// Sent to a connection right after it joins a room.
    ActiveMembers { room_key: RoomKey, members: Vec<MemberInfo> },
    MemberJoined { room_key: RoomKey, member: MemberInfo },
    MemberLeft { room_key: RoomKey, user_id: UserId, connection_id: ConnectionId },

    PresenceChanged { user_id: UserId, online: bool, last_seen_at: DateTime<Utc> },
    OnlineUsers { user_ids: Vec<UserId> },

    /// Sent to the caller once the call exists.
    CallStarted { call: CallSnapshot },
    /// Sent to every connection of every callee.
    IncomingCall { call: CallSnapshot },
    CallAccepted { call_id: CallId, user_id: UserId },
    CallParticipantUpdated { call_id: CallId, user_id: UserId, status: ParticipantStatus },
    CallEnded { call_id: CallId, status: CallStatus, reason: CallEndReason },

    /// Sent to a mesh joiner: the peers it must offer to.
    ExistingParticipants { meeting_id: String, participants: Vec<MeshPeer> },
    UserJoined { meeting_id: String, user_id: UserId, connection_id: ConnectionId },
    UserLeft { meeting_id: String, user_id: UserId },

    SdpOffer { room_key: RoomKey, from: UserId, body: Value },
    SdpAnswer { room_key: RoomKey, from: UserId, body: Value },
    IceCandidate { room_key: RoomKey, from: UserId, body: Value },

    DocState { snapshot: DocumentSnapshot },
    /// A merged mutation, rebroadcast to the rest of the room.
    DocUpdate { room_key: RoomKey, version: u64, op: DocOperation, modified_by: UserId },
    DocAck { room_key: RoomKey, version: u64, applied: bool },
    UserTyping { room_key: RoomKey, user_id: UserId, typing: bool },

    Error {
        code: String,
        message: String,
        retryable: bool,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        details: Value,
    },
}

impl ServerEvent {
    pub fn signal(kind: SignalKind, room_key: RoomKey, from: UserId, body: Value) -> Self {
        match kind {
            SignalKind::SdpOffer => Self::SdpOffer { room_key, from, body },
            SignalKind::SdpAnswer => Self::SdpAnswer { room_key, from, body },
            SignalKind::IceCandidate => Self::IceCandidate { room_key, from, body },
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Error { code: code.into(), message: message.into(), retryable, details: Value::Null }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::ActiveMembers { .. } => "active_members",
            Self::MemberJoined { .. } => "member_joined",
            Self::MemberLeft { .. } => "member_left",
            Self::PresenceChanged { .. } => "presence_changed",
            Self::OnlineUsers { .. } => "online_users",
            Self::CallStarted { .. } => "call_started",
            Self::IncomingCall { .. } => "incoming_call",
            Self::CallAccepted { .. } => "call_accepted",
            Self::CallParticipantUpdated { .. } => "call_participant_updated",
            Self::CallEnded { .. } => "call_ended",
            Self::ExistingParticipants { .. } => "existing_participants",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::SdpOffer { .. } => "sdp_offer",
            Self::SdpAnswer { .. } => "sdp_answer",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::DocState { .. } => "doc_state",
            Self::DocUpdate { .. } => "doc_update",
            Self::DocAck { .. } => "doc_ack",
            Self::UserTyping { .. } => "user_typing",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn join_room_deserializes_from_wire_json() {
        let event: ClientEvent =
            serde_json::from_value(json!({"type": "join_room", "kind": "chat", "room_id": "general"}))
                .unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinRoom { kind: RoomKind::Chat, room_id: "general".into() }
        );
        assert_eq!(event.name(), "join_room");
    }

    #[test]
    fn unit_events_need_only_a_type() {
        let event: ClientEvent = serde_json::from_str(r#"{"type":"presence_online"}"#).unwrap();
        assert_eq!(event, ClientEvent::PresenceOnline);
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn signaling_event_splits_into_parts() {
        let to = Uuid::new_v4();
        let event = ClientEvent::IceCandidate {
            room_key: "meeting:standup".parse().unwrap(),
            to,
            body: json!({"candidate": "a=1"}),
        };
        let (kind, room_key, target, body) = event.into_signal().unwrap();
        assert_eq!(kind, SignalKind::IceCandidate);
        assert_eq!(room_key.to_string(), "meeting:standup");
        assert_eq!(target, to);
        assert_eq!(body["candidate"], "a=1");
        assert!(ClientEvent::GetOnlineUsers.into_signal().is_err());
    }

    #[test]
    fn relayed_signal_carries_sender() {
        let from = Uuid::new_v4();
        let event = ServerEvent::signal(
            SignalKind::SdpAnswer,
            "call:abc".parse().unwrap(),
            from,
            json!({"sdp": "v=0"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "sdp_answer");
        assert_eq!(json["room_key"], "call:abc");
        assert_eq!(json["from"], from.to_string());
        assert_eq!(json["body"]["sdp"], "v=0");
    }

    #[test]
    fn error_event_omits_null_details() {
        let json = serde_json::to_value(ServerEvent::error("NOT_FOUND", "gone", false)).unwrap();
        assert_eq!(json, json!({"type": "error", "code": "NOT_FOUND", "message": "gone", "retryable": false}));
    }
}
