//! Call sessions: the per-call state machine and the manager that owns the
//! live ones together with their ring and monitor timers.
//!
//! ```text
//! ringing --(invitee joins)-------------------> ongoing
//! ringing --(ring timeout, nobody joined)-----> missed
//! ringing --(starter cancels)-----------------> cancelled
//! ringing --(invitee rejects, 1:1)------------> rejected
//! ongoing --(fewer than 2 live joined)--------> ended
//! *       --(explicit end by a participant)---> ended
//! ```

pub mod manager;

use chrono::{DateTime, Utc};
use huddle_common::types::{
    CallEndReason, CallId, CallKind, CallParticipant, CallSnapshot, CallStatus, ParticipantStatus,
    UserId,
};
use serde_json::json;
use tokio::time::Instant;

use crate::error::{ErrorCode, RelayError};

pub use manager::{CallSessionManager, CallTimer, CallTimerKind, CallUpdate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("call {0} is not live")]
    NotFound(CallId),
    #[error("a call needs at least one callee besides the caller")]
    NoCallees,
    #[error("a one-to-one call needs exactly one callee")]
    OneToOneNeedsOneCallee,
    #[error("user is not a participant of this call")]
    NotParticipant,
    #[error("only the caller can cancel a call")]
    NotStarter,
    #[error("cannot {action} a call that is {status}")]
    InvalidTransition { action: &'static str, status: CallStatus },
    #[error("cannot {action} while participant status is {participant}")]
    InvalidParticipantState { action: &'static str, participant: &'static str },
}

impl CallError {
    pub fn to_relay_error(&self) -> RelayError {
        let code = match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::NoCallees | Self::OneToOneNeedsOneCallee => ErrorCode::ValidationFailed,
            Self::NotParticipant | Self::NotStarter => ErrorCode::AuthForbidden,
            Self::InvalidTransition { .. } | Self::InvalidParticipantState { .. } => {
                ErrorCode::InvalidTransition
            }
        };
        let error = RelayError::new(code, self.to_string());
        match self {
            Self::NotFound(call_id) => error.with_details(json!({ "call_id": call_id })),
            Self::InvalidTransition { status, .. } => {
                error.with_details(json!({ "status": status.as_str() }))
            }
            _ => error,
        }
    }
}

/// What an operation did to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// Idempotent repeat; nothing to announce or persist.
    Unchanged,
    /// A participant changed while the call stayed live.
    Updated { became_ongoing: bool },
    /// The call reached a terminal status and leaves the live registry.
    Terminated(CallEndReason),
}

/// One live call. Pure state: timers and fan-out belong to the manager and
/// the gateway.
#[derive(Debug, Clone)]
pub struct CallSession {
    snapshot: CallSnapshot,
    started_at: Instant,
}

impl CallSession {
    /// Creates a ringing call. The starter is recorded as joined; duplicate
    /// and self callees are collapsed.
    pub fn start(
        call_id: CallId,
        kind: CallKind,
        started_by: UserId,
        callee_ids: &[UserId],
        now: Instant,
        at: DateTime<Utc>,
    ) -> Result<Self, CallError> {
        let mut callees: Vec<UserId> = Vec::with_capacity(callee_ids.len());
        for callee in callee_ids {
            if *callee != started_by && !callees.contains(callee) {
                callees.push(*callee);
            }
        }
        if callees.is_empty() {
            return Err(CallError::NoCallees);
        }
        if kind == CallKind::OneToOne && callees.len() != 1 {
            return Err(CallError::OneToOneNeedsOneCallee);
        }

        let mut participants = vec![CallParticipant {
            user_id: started_by,
            status: ParticipantStatus::Joined,
            joined_at: Some(at),
            left_at: None,
        }];
        participants.extend(callees.into_iter().map(|user_id| CallParticipant {
            user_id,
            status: ParticipantStatus::Invited,
            joined_at: None,
            left_at: None,
        }));

        Ok(Self {
            snapshot: CallSnapshot {
                call_id,
                kind,
                status: CallStatus::Ringing,
                started_by,
                participants,
                created_at: at,
                updated_at: at,
                ended_at: None,
                end_reason: None,
            },
            started_at: now,
        })
    }

    pub fn snapshot(&self) -> &CallSnapshot {
        &self.snapshot
    }

    pub fn status(&self) -> CallStatus {
        self.snapshot.status
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn join(&mut self, user_id: UserId, at: DateTime<Utc>) -> Result<CallTransition, CallError> {
        self.ensure_live("join")?;
        let status = self.snapshot.status;
        let participant = self.participant_mut(user_id)?;
        match participant.status {
            ParticipantStatus::Joined => return Ok(CallTransition::Unchanged),
            ParticipantStatus::Invited => {}
            ParticipantStatus::Left if status == CallStatus::Ongoing => {}
            other => {
                return Err(CallError::InvalidParticipantState {
                    action: "join",
                    participant: other.as_str(),
                })
            }
        }
        participant.status = ParticipantStatus::Joined;
        participant.joined_at = Some(at);
        participant.left_at = None;

        let became_ongoing = status == CallStatus::Ringing;
        if became_ongoing {
            self.snapshot.status = CallStatus::Ongoing;
        }
        self.snapshot.updated_at = at;
        Ok(CallTransition::Updated { became_ongoing })
    }

    /// Marks the participant left, then ends the call when fewer than two
    /// joined participants remain. The caller leaving a ringing call cancels it.
    pub fn leave(&mut self, user_id: UserId, at: DateTime<Utc>) -> Result<CallTransition, CallError> {
        self.ensure_live("leave")?;
        if self.snapshot.status == CallStatus::Ringing {
            if user_id == self.snapshot.started_by {
                return Ok(self.terminate(CallEndReason::Cancelled, at));
            }
            self.participant_mut(user_id)?;
            return Err(CallError::InvalidParticipantState { action: "leave", participant: "invited" });
        }

        let participant = self.participant_mut(user_id)?;
        match participant.status {
            ParticipantStatus::Joined => {}
            ParticipantStatus::Left => return Ok(CallTransition::Unchanged),
            other => {
                return Err(CallError::InvalidParticipantState {
                    action: "leave",
                    participant: other.as_str(),
                })
            }
        }
        participant.status = ParticipantStatus::Left;
        participant.left_at = Some(at);
        self.snapshot.updated_at = at;

        match self.joined_count() {
            0 => Ok(self.terminate(CallEndReason::AllLeft, at)),
            1 => Ok(self.terminate(CallEndReason::InsufficientParticipants, at)),
            _ => Ok(CallTransition::Updated { became_ongoing: false }),
        }
    }

    /// A one-to-one reject ends the call. A group call ends once no invitee
    /// is still invited or joined.
    pub fn reject(&mut self, user_id: UserId, at: DateTime<Utc>) -> Result<CallTransition, CallError> {
        self.ensure_live("reject")?;
        let started_by = self.snapshot.started_by;
        let participant = self.participant_mut(user_id)?;
        match participant.status {
            ParticipantStatus::Rejected => return Ok(CallTransition::Unchanged),
            ParticipantStatus::Invited if user_id != started_by => {}
            other => {
                return Err(CallError::InvalidParticipantState {
                    action: "reject",
                    participant: other.as_str(),
                })
            }
        }
        participant.status = ParticipantStatus::Rejected;
        self.snapshot.updated_at = at;

        let invitee_still_in = self.snapshot.participants.iter().any(|participant| {
            participant.user_id != started_by
                && matches!(participant.status, ParticipantStatus::Invited | ParticipantStatus::Joined)
        });
        if self.snapshot.kind == CallKind::OneToOne || !invitee_still_in {
            return Ok(self.terminate(CallEndReason::Rejected, at));
        }
        Ok(CallTransition::Updated { became_ongoing: false })
    }

    pub fn cancel(&mut self, user_id: UserId, at: DateTime<Utc>) -> Result<CallTransition, CallError> {
        self.ensure_live("cancel")?;
        self.participant_mut(user_id)?;
        if user_id != self.snapshot.started_by {
            return Err(CallError::NotStarter);
        }
        if self.snapshot.status != CallStatus::Ringing {
            return Err(CallError::InvalidTransition { action: "cancel", status: self.snapshot.status });
        }
        Ok(self.terminate(CallEndReason::Cancelled, at))
    }

    pub fn end(&mut self, user_id: UserId, at: DateTime<Utc>) -> Result<CallTransition, CallError> {
        self.ensure_live("end")?;
        self.participant_mut(user_id)?;
        Ok(self.terminate(CallEndReason::EndedByParticipant, at))
    }

    /// `by` is `None` when the ring timer or the sweep gives up on the call.
    pub fn mark_missed(
        &mut self,
        by: Option<UserId>,
        at: DateTime<Utc>,
    ) -> Result<CallTransition, CallError> {
        self.ensure_live("mark missed")?;
        if let Some(user_id) = by {
            self.participant_mut(user_id)?;
        }
        if self.snapshot.status != CallStatus::Ringing {
            return Err(CallError::InvalidTransition {
                action: "mark missed",
                status: self.snapshot.status,
            });
        }
        Ok(self.terminate(CallEndReason::Missed, at))
    }

    /// Ends an ongoing call whose live joined participants dropped below two.
    pub fn enforce_min_participants(
        &mut self,
        live: impl Fn(UserId) -> bool,
        at: DateTime<Utc>,
    ) -> CallTransition {
        if self.snapshot.status != CallStatus::Ongoing {
            return CallTransition::Unchanged;
        }
        let live_joined = self
            .snapshot
            .participants
            .iter()
            .filter(|participant| participant.status == ParticipantStatus::Joined)
            .filter(|participant| live(participant.user_id))
            .count();
        if live_joined < 2 {
            return self.terminate(CallEndReason::InsufficientParticipants, at);
        }
        CallTransition::Unchanged
    }

    fn terminate(&mut self, reason: CallEndReason, at: DateTime<Utc>) -> CallTransition {
        for participant in &mut self.snapshot.participants {
            match participant.status {
                ParticipantStatus::Invited => participant.status = ParticipantStatus::Missed,
                ParticipantStatus::Joined => {
                    participant.status = ParticipantStatus::Left;
                    participant.left_at = Some(at);
                }
                _ => {}
            }
        }
        self.snapshot.status = reason.status();
        self.snapshot.end_reason = Some(reason);
        self.snapshot.ended_at = Some(at);
        self.snapshot.updated_at = at;
        CallTransition::Terminated(reason)
    }

    fn joined_count(&self) -> usize {
        self.snapshot
            .participants
            .iter()
            .filter(|participant| participant.status == ParticipantStatus::Joined)
            .count()
    }

    fn ensure_live(&self, action: &'static str) -> Result<(), CallError> {
        if self.snapshot.status.is_terminal() {
            return Err(CallError::InvalidTransition { action, status: self.snapshot.status });
        }
        Ok(())
    }

    fn participant_mut(&mut self, user_id: UserId) -> Result<&mut CallParticipant, CallError> {
        self.snapshot
            .participants
            .iter_mut()
            .find(|participant| participant.user_id == user_id)
            .ok_or(CallError::NotParticipant)
    }
}
