// Core domain types shared by the relay and its clients.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type UserId = Uuid;
pub type ConnectionId = Uuid;
pub type CallId = Uuid;

/// Longest room id accepted inside a [`RoomKey`].
pub const MAX_ROOM_ID_LEN: usize = 128;

/// The kind of collaboration space a room represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    Chat,
    Document,
    Whiteboard,
    Call,
    Meeting,
}

impl RoomKind {
    pub const ALL: [RoomKind; 5] =
        [Self::Chat, Self::Document, Self::Whiteboard, Self::Call, Self::Meeting];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Document => "document",
            Self::Whiteboard => "whiteboard",
            Self::Call => "call",
            Self::Meeting => "meeting",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Rooms whose members exchange SDP offers/answers and ICE candidates.
    pub const fn supports_signaling(self) -> bool {
        matches!(self, Self::Call | Self::Meeting)
    }

    /// Rooms backed by a mergeable shared document.
    pub const fn is_collaborative(self) -> bool {
        matches!(self, Self::Document | Self::Whiteboard)
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomKeyError {
    #[error("room key must look like <kind>:<id>")]
    MissingSeparator,
    #[error("unknown room kind '{0}'")]
    UnknownKind(String),
    #[error("room id must not be empty")]
    EmptyId,
    #[error("room id exceeds {MAX_ROOM_ID_LEN} characters")]
    IdTooLong,
}

/// Identifies a room as `<kind>:<id>`, e.g. `whiteboard:board-7`.
///
/// A connection holds at most one room per kind, so the kind is part of the
/// key rather than a property of the room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey {
    kind: RoomKind,
    id: String,
}

impl RoomKey {
    pub fn new(kind: RoomKind, id: impl Into<String>) -> Result<Self, RoomKeyError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(RoomKeyError::EmptyId);
        }
        if trimmed.chars().count() > MAX_ROOM_ID_LEN {
            return Err(RoomKeyError::IdTooLong);
        }
        Ok(Self { kind, id: trimmed.to_string() })
    }

    /// The room shared by every participant of a call.
    pub fn for_call(call_id: CallId) -> Self {
        Self { kind: RoomKind::Call, id: call_id.to_string() }
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for RoomKey {
    type Err = RoomKeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, id) = value.split_once(':').ok_or(RoomKeyError::MissingSeparator)?;
        let kind = RoomKind::parse(kind).ok_or_else(|| RoomKeyError::UnknownKind(kind.into()))?;
        Self::new(kind, id)
    }
}

impl TryFrom<String> for RoomKey {
    type Error = RoomKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RoomKey> for String {
    fn from(key: RoomKey) -> Self {
        key.to_string()
    }
}

/// Who a room member is, as announced to the other members.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberInfo {
    pub user_id: UserId,
    pub display_name: String,
    pub connection_id: ConnectionId,
}

/// A participant of a meeting mesh.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeshPeer {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

// ── Calls ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    OneToOne,
    Group,
}

impl CallKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneToOne => "one_to_one",
            Self::Group => "group",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "one_to_one" => Some(Self::OneToOne),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Ongoing,
    Ended,
    Missed,
    Rejected,
    Cancelled,
}

impl CallStatus {
    pub const LIVE: [CallStatus; 2] = [Self::Ringing, Self::Ongoing];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Ongoing => "ongoing",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ringing" => Some(Self::Ringing),
            "ongoing" => Some(Self::Ongoing),
            "ended" => Some(Self::Ended),
            "missed" => Some(Self::Missed),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses are absorbing: no further transition is allowed.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Ringing | Self::Ongoing)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantStatus {
    Invited,
    Joined,
    Left,
    Missed,
    Rejected,
}

impl ParticipantStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invited => "invited",
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Missed => "missed",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    /// A participant explicitly ended the call for everyone.
    EndedByParticipant,
    /// Fewer than two joined participants remained live.
    InsufficientParticipants,
    /// Every joined participant left.
    AllLeft,
    /// Nobody answered before the ring timeout.
    Missed,
    /// Every callee declined.
    Rejected,
    /// The caller hung up before anyone answered.
    Cancelled,
}

impl CallEndReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EndedByParticipant => "ended_by_participant",
            Self::InsufficientParticipants => "insufficient_participants",
            Self::AllLeft => "all_left",
            Self::Missed => "missed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// The terminal status a call lands in for this reason.
    pub const fn status(self) -> CallStatus {
        match self {
            Self::EndedByParticipant | Self::InsufficientParticipants | Self::AllLeft => {
                CallStatus::Ended
            }
            Self::Missed => CallStatus::Missed,
            Self::Rejected => CallStatus::Rejected,
            Self::Cancelled => CallStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallParticipant {
    pub user_id: UserId,
    pub status: ParticipantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a call, as persisted and as sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallSnapshot {
    pub call_id: CallId,
    pub kind: CallKind,
    pub status: CallStatus,
    pub started_by: UserId,
    pub participants: Vec<CallParticipant>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<CallEndReason>,
}

impl CallSnapshot {
    pub fn participant(&self, user_id: UserId) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn room_key(&self) -> RoomKey {
        RoomKey::for_call(self.call_id)
    }
}

// ── Signaling ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    SdpOffer,
    SdpAnswer,
    IceCandidate,
}

impl SignalKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SdpOffer => "sdp_offer",
            Self::SdpAnswer => "sdp_answer",
            Self::IceCandidate => "ice_candidate",
        }
    }
}

// ── Collaborative documents ──────────────────────────────────────────

/// A drawable element. Everything besides `id` is opaque to the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Shape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A mutation submitted against a collaborative document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DocOperation {
    /// Append shapes. Ids already present are ignored.
    AddShapes { shapes: Vec<Shape> },
    /// Overwrite canvas metadata keys.
    Canvas { metadata: Map<String, Value> },
    /// Drop shapes by id.
    RemoveShapes { ids: Vec<String> },
}

impl DocOperation {
    /// True when applying the operation would leave the document unchanged.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::AddShapes { shapes } => shapes.is_empty(),
            Self::Canvas { metadata } => metadata.is_empty(),
            Self::RemoveShapes { ids } => ids.is_empty(),
        }
    }
}

/// Full state of a collaborative document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentSnapshot {
    pub room_key: RoomKey,
    pub version: u64,
    pub shapes: Vec<Shape>,
    pub canvas: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_key_round_trips_through_display_and_parse() {
        let key = RoomKey::new(RoomKind::Whiteboard, "board-7").unwrap();
        assert_eq!(key.to_string(), "whiteboard:board-7");
        assert_eq!("whiteboard:board-7".parse::<RoomKey>().unwrap(), key);
    }

    #[test]
    fn room_key_keeps_colons_inside_the_id() {
        let key: RoomKey = "chat:team:general".parse().unwrap();
        assert_eq!(key.kind(), RoomKind::Chat);
        assert_eq!(key.id(), "team:general");
    }

    #[test]
    fn room_key_rejects_malformed_input() {
        assert_eq!("chat".parse::<RoomKey>(), Err(RoomKeyError::MissingSeparator));
        assert_eq!(
            "lobby:1".parse::<RoomKey>(),
            Err(RoomKeyError::UnknownKind("lobby".into()))
        );
        assert_eq!("chat:   ".parse::<RoomKey>(), Err(RoomKeyError::EmptyId));
        let long = format!("chat:{}", "x".repeat(MAX_ROOM_ID_LEN + 1));
        assert_eq!(long.parse::<RoomKey>(), Err(RoomKeyError::IdTooLong));
    }

    #[test]
    fn room_key_serializes_as_plain_string() {
        let key = RoomKey::new(RoomKind::Meeting, "standup").unwrap();
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json, Value::String("meeting:standup".into()));
        let back: RoomKey = serde_json::from_value(json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_value::<RoomKey>(Value::String("nope".into())).is_err());
    }

    #[test]
    fn only_call_and_meeting_rooms_carry_signaling() {
        let signaling: Vec<_> =
            RoomKind::ALL.into_iter().filter(|kind| kind.supports_signaling()).collect();
        assert_eq!(signaling, vec![RoomKind::Call, RoomKind::Meeting]);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Ongoing.is_terminal());
        for status in
            [CallStatus::Ended, CallStatus::Missed, CallStatus::Rejected, CallStatus::Cancelled]
        {
            assert!(status.is_terminal(), "{status} should be terminal");
            assert_eq!(CallStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn end_reason_maps_to_terminal_status() {
        assert_eq!(CallEndReason::InsufficientParticipants.status(), CallStatus::Ended);
        assert_eq!(CallEndReason::Missed.status(), CallStatus::Missed);
        assert_eq!(CallEndReason::Cancelled.status(), CallStatus::Cancelled);
    }

    #[test]
    fn shape_keeps_unknown_attributes() {
        let shape: Shape =
            serde_json::from_str(r#"{"id":"s1","type":"rect","x":4,"style":{"fill":"red"}}"#)
                .unwrap();
        assert_eq!(shape.id.as_deref(), Some("s1"));
        assert_eq!(shape.attributes["type"], "rect");
        assert_eq!(shape.attributes["style"]["fill"], "red");
        assert!(!shape.attributes.contains_key("id"));
    }

    #[test]
    fn doc_operation_is_tagged_by_op() {
        let op: DocOperation =
            serde_json::from_str(r##"{"op":"canvas","metadata":{"background":"#fff"}}"##).unwrap();
        assert!(matches!(&op, DocOperation::Canvas { metadata } if metadata.len() == 1));
        assert!(!op.is_noop());
        assert!(DocOperation::RemoveShapes { ids: vec![] }.is_noop());
    }
}
