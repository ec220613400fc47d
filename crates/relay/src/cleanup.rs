// Periodic sweep of the real-time core.
//
// Timers and disconnect handling keep state tidy on the happy path. The
// sweep catches what slips through: sockets that died without a close,
// calls whose timers were lost, rooms nobody left cleanly and documents
// nobody watches any more.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, info};

use crate::{
    gateway::{is_live_in_call, CoreHandle, RealtimeCore},
    metrics,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub connections_reaped: usize,
    pub calls_ended: usize,
    pub rooms_pruned: usize,
    pub documents_unloaded: usize,
    pub rate_limits_dropped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl RealtimeCore {
    pub(crate) fn sweep(&mut self, now: Instant, at: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for connection_id in self.connections.closed() {
            debug!(connection_id = %connection_id, "reaping closed connection");
            self.disconnect(connection_id, now, at);
            report.connections_reaped += 1;
        }

        let rooms = &self.rooms;
        let connections = &self.connections;
        let updates = self.calls.sweep(
            now,
            self.config.stale_ringing_after,
            |call_id, user_id| is_live_in_call(rooms, connections, call_id, user_id),
            at,
        );
        report.calls_ended = updates.iter().filter(|update| update.end_reason().is_some()).count();
        for update in updates {
            self.apply_call_update(update, None);
        }

        report.rooms_pruned = self.rooms.prune_empty();

        let rooms = &self.rooms;
        let unloaded = self.documents.unload_unwatched(|room_key| !rooms.members_of(room_key).is_empty());
        report.documents_unloaded = unloaded.len();
        for snapshot in unloaded {
            self.persist_document(snapshot);
        }

        let connections = &self.connections;
        report.rate_limits_dropped =
            self.presence.retain_connections(|connection_id| connections.contains(connection_id));

        metrics::record_cleanup_sweep(self.gauges());
        if report.is_empty() {
            debug!("cleanup sweep found nothing to do");
        } else {
            info!(
                connections_reaped = report.connections_reaped,
                calls_ended = report.calls_ended,
                rooms_pruned = report.rooms_pruned,
                documents_unloaded = report.documents_unloaded,
                rate_limits_dropped = report.rate_limits_dropped,
                "cleanup sweep"
            );
        }
        report
    }
}

/// Asks the core for a sweep every `interval`. Stops once the core is gone.
pub fn spawn_cleanup_scheduler(handle: CoreHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !handle.sweep() {
                debug!("realtime core stopped, cleanup scheduler exiting");
                break;
            }
        }
    })
}
