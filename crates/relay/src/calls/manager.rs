use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use huddle_common::types::{CallEndReason, CallId, CallKind, CallSnapshot, CallStatus, UserId};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use super::{CallError, CallSession, CallTransition};
use crate::{
    metrics,
    timer::{TimerRegistry, TimerSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTimerKind {
    /// One-shot: the call rang for the whole ring timeout.
    Ring,
    /// Recurring: re-check live joined participants of an ongoing call.
    Monitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimer {
    pub call_id: CallId,
    pub kind: CallTimerKind,
    pub token: u64,
}

/// Result of an operation that changed a call. `snapshot` is the state after
/// the change, including the frozen state of a call that just terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallUpdate {
    pub snapshot: CallSnapshot,
    pub transition: CallTransition,
}

impl CallUpdate {
    pub fn end_reason(&self) -> Option<CallEndReason> {
        match self.transition {
            CallTransition::Terminated(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Owns every live call. Terminal calls are evicted as soon as they
/// terminate; their record only lives on in the call store.
pub struct CallSessionManager {
    sessions: HashMap<CallId, CallSession>,
    timers: TimerRegistry<CallId, CallTimer>,
    ring_timeout: Duration,
    monitor_interval: Duration,
}

impl CallSessionManager {
    pub fn new(ring_timeout: Duration, monitor_interval: Duration, sink: TimerSink<CallTimer>) -> Self {
        Self {
            sessions: HashMap::new(),
            timers: TimerRegistry::new(sink),
            ring_timeout,
            monitor_interval,
        }
    }

    /// Creates a ringing call and arms its ring timer.
    pub fn start(
        &mut self,
        started_by: UserId,
        callee_ids: &[UserId],
        kind: CallKind,
        now: Instant,
        at: DateTime<Utc>,
    ) -> Result<CallSnapshot, CallError> {
        let call_id = Uuid::new_v4();
        let session = CallSession::start(call_id, kind, started_by, callee_ids, now, at)?;
        let snapshot = session.snapshot().clone();
        self.sessions.insert(call_id, session);
        self.timers.arm_once(call_id, self.ring_timeout, |token| CallTimer {
            call_id,
            kind: CallTimerKind::Ring,
            token,
        });
        info!(call_id = %call_id, started_by = %started_by, kind = kind.as_str(), "call ringing");
        Ok(snapshot)
    }

    pub fn join(&mut self, call_id: CallId, user_id: UserId, at: DateTime<Utc>) -> Result<CallUpdate, CallError> {
        self.apply(call_id, |session| session.join(user_id, at))
    }

    pub fn leave(&mut self, call_id: CallId, user_id: UserId, at: DateTime<Utc>) -> Result<CallUpdate, CallError> {
        self.apply(call_id, |session| session.leave(user_id, at))
    }

    pub fn reject(&mut self, call_id: CallId, user_id: UserId, at: DateTime<Utc>) -> Result<CallUpdate, CallError> {
        self.apply(call_id, |session| session.reject(user_id, at))
    }

    pub fn cancel(&mut self, call_id: CallId, user_id: UserId, at: DateTime<Utc>) -> Result<CallUpdate, CallError> {
        self.apply(call_id, |session| session.cancel(user_id, at))
    }

    pub fn end(&mut self, call_id: CallId, user_id: UserId, at: DateTime<Utc>) -> Result<CallUpdate, CallError> {
        self.apply(call_id, |session| session.end(user_id, at))
    }

    pub fn mark_missed(
        &mut self,
        call_id: CallId,
        by: Option<UserId>,
        at: DateTime<Utc>,
    ) -> Result<CallUpdate, CallError> {
        self.apply(call_id, |session| session.mark_missed(by, at))
    }

    /// Handles a fired ring or monitor timer. Stale firings are ignored.
    pub fn on_timer(
        &mut self,
        timer: CallTimer,
        live: impl Fn(CallId, UserId) -> bool,
        at: DateTime<Utc>,
    ) -> Option<CallUpdate> {
        if !self.timers.is_current(&timer.call_id, timer.token) {
            debug!(call_id = %timer.call_id, kind = ?timer.kind, "ignoring stale call timer");
            return None;
        }
        let call_id = timer.call_id;
        match timer.kind {
            CallTimerKind::Ring => {
                self.timers.complete(&call_id, timer.token);
                self.apply(call_id, |session| session.mark_missed(None, at)).ok()
            }
            CallTimerKind::Monitor => self
                .apply(call_id, |session| {
                    Ok(session.enforce_min_participants(|user_id| live(call_id, user_id), at))
                })
                .ok(),
        }
    }

    /// Reaps ringing calls older than `stale_after` and ongoing calls below
    /// two live joined participants.
    pub fn sweep(
        &mut self,
        now: Instant,
        stale_after: Duration,
        live: impl Fn(CallId, UserId) -> bool,
        at: DateTime<Utc>,
    ) -> Vec<CallUpdate> {
        let mut call_ids: Vec<CallId> = self.sessions.keys().copied().collect();
        call_ids.sort();

        let mut updates = Vec::new();
        for call_id in call_ids {
            let Some((status, started_at)) =
                self.sessions.get(&call_id).map(|session| (session.status(), session.started_at()))
            else {
                continue;
            };
            let result = match status {
                CallStatus::Ringing if now.duration_since(started_at) >= stale_after => {
                    self.apply(call_id, |session| session.mark_missed(None, at))
                }
                CallStatus::Ongoing => self.apply(call_id, |session| {
                    Ok(session.enforce_min_participants(|user_id| live(call_id, user_id), at))
                }),
                _ => continue,
            };
            if let Ok(update) = result {
                if update.transition != CallTransition::Unchanged {
                    updates.push(update);
                }
            }
        }
        updates
    }

    pub fn get(&self, call_id: CallId) -> Option<&CallSnapshot> {
        self.sessions.get(&call_id).map(CallSession::snapshot)
    }

    pub fn live_count(&self) -> usize {
        self.sessions.len()
    }

    fn apply(
        &mut self,
        call_id: CallId,
        operation: impl FnOnce(&mut CallSession) -> Result<CallTransition, CallError>,
    ) -> Result<CallUpdate, CallError> {
        let session = self.sessions.get_mut(&call_id).ok_or(CallError::NotFound(call_id))?;
        let transition = operation(session)?;
        let snapshot = session.snapshot().clone();

        match transition {
            CallTransition::Updated { became_ongoing: true } => {
                self.timers.arm_repeating(call_id, self.monitor_interval, |token| CallTimer {
                    call_id,
                    kind: CallTimerKind::Monitor,
                    token,
                });
                info!(call_id = %call_id, "call ongoing");
            }
            CallTransition::Terminated(reason) => {
                self.timers.cancel(&call_id);
                self.sessions.remove(&call_id);
                metrics::record_call_ended(reason.as_str());
                info!(call_id = %call_id, status = %snapshot.status, reason = reason.as_str(), "call terminated");
            }
            CallTransition::Updated { became_ongoing: false } | CallTransition::Unchanged => {}
        }

        Ok(CallUpdate { snapshot, transition })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use huddle_common::types::ParticipantStatus;
    use tokio::sync::mpsc;

    use super::*;

    const RING: Duration = Duration::from_secs(30);
    const MONITOR: Duration = Duration::from_secs(5);

    fn manager() -> (CallSessionManager, mpsc::UnboundedReceiver<CallTimer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: TimerSink<CallTimer> = Arc::new(move |timer| tx.send(timer).is_ok());
        (CallSessionManager::new(RING, MONITOR, sink), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn ring_timeout_marks_the_call_missed() {
        let (mut calls, mut timers) = manager();
        let (caller, callee) = (Uuid::new_v4(), Uuid::new_v4());
        let start = Instant::now();
        let call = calls.start(caller, &[callee], CallKind::OneToOne, start, Utc::now()).unwrap();

        let fired = timers.recv().await.expect("ring timer should fire");
        assert_eq!(start.elapsed(), RING);
        assert_eq!(fired.kind, CallTimerKind::Ring);

        let update = calls.on_timer(fired, |_, _| true, Utc::now()).expect("call should end");
        assert_eq!(update.end_reason(), Some(CallEndReason::Missed));
        assert_eq!(update.snapshot.status, CallStatus::Missed);
        assert_eq!(update.snapshot.participant(callee).unwrap().status, ParticipantStatus::Missed);
        assert!(calls.get(call.call_id).is_none());
        assert_eq!(calls.join(call.call_id, callee, Utc::now()), Err(CallError::NotFound(call.call_id)));
    }

    #[tokio::test(start_paused = true)]
    async fn join_replaces_ring_timer_with_monitor() {
        let (mut calls, mut timers) = manager();
        let (caller, callee) = (Uuid::new_v4(), Uuid::new_v4());
        let start = Instant::now();
        let call = calls.start(caller, &[callee], CallKind::OneToOne, start, Utc::now()).unwrap();

        let update = calls.join(call.call_id, callee, Utc::now()).unwrap();
        assert_eq!(update.transition, CallTransition::Updated { became_ongoing: true });

        let first = timers.recv().await.expect("monitor should tick");
        assert_eq!(first.kind, CallTimerKind::Monitor);
        assert_eq!(start.elapsed(), MONITOR);
        assert!(calls.on_timer(first, |_, _| true, Utc::now()).is_some_and(|update| {
            update.transition == CallTransition::Unchanged
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_ends_call_within_one_interval_of_a_drop() {
        let (mut calls, mut timers) = manager();
        let (caller, callee) = (Uuid::new_v4(), Uuid::new_v4());
        let call = calls.start(caller, &[callee], CallKind::OneToOne, Instant::now(), Utc::now()).unwrap();
        calls.join(call.call_id, callee, Utc::now()).unwrap();
        let dropped_at = Instant::now();

        let tick = timers.recv().await.expect("monitor should tick");
        assert!(dropped_at.elapsed() <= MONITOR);
        let update = calls
            .on_timer(tick, |_, user_id| user_id == caller, Utc::now())
            .expect("monitor should act");

        assert_eq!(update.end_reason(), Some(CallEndReason::InsufficientParticipants));
        assert_eq!(calls.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ring_timer_is_ignored() {
        let (mut calls, _timers) = manager();
        let call = calls
            .start(Uuid::new_v4(), &[Uuid::new_v4()], CallKind::OneToOne, Instant::now(), Utc::now())
            .unwrap();
        let stale = CallTimer { call_id: call.call_id, kind: CallTimerKind::Ring, token: 0 };

        assert!(calls.on_timer(stale, |_, _| true, Utc::now()).is_none());
        assert_eq!(calls.live_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_reaps_stale_ringing_and_thin_ongoing_calls() {
        let (mut calls, _timers) = manager();
        let start = Instant::now();
        let ringing = calls
            .start(Uuid::new_v4(), &[Uuid::new_v4()], CallKind::OneToOne, start, Utc::now())
            .unwrap();
        let callee = Uuid::new_v4();
        let ongoing = calls.start(Uuid::new_v4(), &[callee], CallKind::OneToOne, start, Utc::now()).unwrap();
        calls.join(ongoing.call_id, callee, Utc::now()).unwrap();

        let early = calls.sweep(start + Duration::from_secs(59), Duration::from_secs(60), |_, _| true, Utc::now());
        assert!(early.is_empty());

        let updates = calls.sweep(start + Duration::from_secs(60), Duration::from_secs(60), |_, _| false, Utc::now());
        let mut reasons: Vec<(CallId, Option<CallEndReason>)> =
            updates.iter().map(|update| (update.snapshot.call_id, update.end_reason())).collect();
        reasons.sort_by_key(|(call_id, _)| *call_id == ongoing.call_id);
        assert_eq!(
            reasons,
            vec![
                (ringing.call_id, Some(CallEndReason::Missed)),
                (ongoing.call_id, Some(CallEndReason::InsufficientParticipants)),
            ]
        );
        assert!(calls.sweep(start + Duration::from_secs(90), Duration::from_secs(60), |_, _| false, Utc::now()).is_empty());
    }
}
