//! Presence tracking with a per-user broadcast throttle.
//!
//! Clients only ever see the first and the last genuine flip inside a
//! throttle window: a flip inside the window arms a trailing flush at the
//! window's end, and the flush broadcasts only when the state still differs
//! from what was last announced.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use huddle_common::types::{ConnectionId, UserId};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    metrics,
    timer::{TimerRegistry, TimerSink},
};

/// Fired when a suppressed flip's window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceFlush {
    pub user_id: UserId,
    pub token: u64,
}

/// A state change to announce to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub online: bool,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceDecision {
    Broadcast(PresenceChange),
    /// Recorded but held back until `flush_at`.
    Suppressed { flush_at: Instant },
    /// Matches what clients already believe.
    Unchanged,
}

#[derive(Debug, Clone)]
struct PresenceRecord {
    online: bool,
    last_seen_at: DateTime<Utc>,
    broadcast_online: bool,
    last_broadcast_at: Option<Instant>,
}

pub struct PresenceTracker {
    throttle: Duration,
    online_users_interval: Duration,
    records: HashMap<UserId, PresenceRecord>,
    online_users_requests: HashMap<ConnectionId, Instant>,
    flushes: TimerRegistry<UserId, PresenceFlush>,
}

impl PresenceTracker {
    pub fn new(
        throttle: Duration,
        online_users_interval: Duration,
        sink: TimerSink<PresenceFlush>,
    ) -> Self {
        Self {
            throttle,
            online_users_interval,
            records: HashMap::new(),
            online_users_requests: HashMap::new(),
            flushes: TimerRegistry::new(sink),
        }
    }

    pub fn set_online(&mut self, user_id: UserId, now: Instant, at: DateTime<Utc>) -> PresenceDecision {
        self.set(user_id, true, now, at)
    }

    pub fn set_offline(&mut self, user_id: UserId, now: Instant, at: DateTime<Utc>) -> PresenceDecision {
        self.set(user_id, false, now, at)
    }

    fn set(&mut self, user_id: UserId, online: bool, now: Instant, at: DateTime<Utc>) -> PresenceDecision {
        let record = self.records.entry(user_id).or_insert(PresenceRecord {
            online: false,
            last_seen_at: at,
            broadcast_online: false,
            last_broadcast_at: None,
        });
        record.online = online;
        record.last_seen_at = at;

        if record.broadcast_online == online {
            if self.flushes.cancel(&user_id) {
                debug!(user_id = %user_id, online, "presence returned to announced state, flush cancelled");
            }
            return PresenceDecision::Unchanged;
        }

        let window_open_at = record.last_broadcast_at.map(|last| last + self.throttle);
        match window_open_at {
            Some(flush_at) if flush_at > now => {
                if !self.flushes.is_armed(&user_id) {
                    self.flushes.arm_once(user_id, flush_at - now, |token| PresenceFlush {
                        user_id,
                        token,
                    });
                }
                metrics::record_presence_broadcast(true);
                debug!(user_id = %user_id, online, "presence broadcast throttled");
                PresenceDecision::Suppressed { flush_at }
            }
            _ => {
                self.flushes.cancel(&user_id);
                PresenceDecision::Broadcast(Self::announce(user_id, record, now))
            }
        }
    }

    /// Handles a trailing flush. Returns the change to broadcast, if any.
    pub fn flush(&mut self, flush: PresenceFlush, now: Instant) -> Option<PresenceChange> {
        if !self.flushes.is_current(&flush.user_id, flush.token) {
            return None;
        }
        self.flushes.complete(&flush.user_id, flush.token);

        let record = self.records.get_mut(&flush.user_id)?;
        if record.online == record.broadcast_online {
            return None;
        }
        Some(Self::announce(flush.user_id, record, now))
    }

    fn announce(user_id: UserId, record: &mut PresenceRecord, now: Instant) -> PresenceChange {
        record.broadcast_online = record.online;
        record.last_broadcast_at = Some(now);
        metrics::record_presence_broadcast(false);
        PresenceChange { user_id, online: record.online, last_seen_at: record.last_seen_at }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.records.get(&user_id).is_some_and(|record| record.online)
    }

    /// Users currently recorded online, sorted for stable output.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .records
            .iter()
            .filter(|(_, record)| record.online)
            .map(|(user_id, _)| *user_id)
            .collect();
        users.sort();
        users
    }

    /// Per-connection rate limit for `get_online_users`. A refused request
    /// does not extend the window.
    pub fn allow_online_users_request(&mut self, connection_id: ConnectionId, now: Instant) -> bool {
        match self.online_users_requests.get(&connection_id) {
            Some(last) if now.duration_since(*last) < self.online_users_interval => false,
            _ => {
                self.online_users_requests.insert(connection_id, now);
                true
            }
        }
    }

    pub fn forget_connection(&mut self, connection_id: ConnectionId) {
        self.online_users_requests.remove(&connection_id);
    }

    /// Drops rate-limit entries for connections that no longer exist.
    pub fn retain_connections(&mut self, mut live: impl FnMut(ConnectionId) -> bool) -> usize {
        let before = self.online_users_requests.len();
        self.online_users_requests.retain(|connection_id, _| live(*connection_id));
        before - self.online_users_requests.len()
    }

    pub fn pending_flushes(&self) -> usize {
        self.flushes.len()
    }
}
