//! The event gateway: one task owning every real-time component.
//!
//! Socket tasks, timers and the cleanup scheduler never touch component state
//! directly. They send [`CoreCommand`]s into a single unbounded queue that
//! [`RealtimeCore`] drains in FIFO order, so every handler below runs to
//! completion without locks and without awaiting. Store I/O happens in
//! spawned tasks on snapshots taken here.

mod dispatch;


use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huddle_common::{
    protocol::ws::{ClientEvent, ServerEvent, CURRENT_PROTOCOL_VERSION},
    types::{
        CallEndReason, CallId, CallSnapshot, ConnectionId, DocumentSnapshot, MemberInfo, MeshPeer,
        RoomKey, RoomKind, UserId,
    },
};
use serde_json::json;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth::Identity,
    calls::{CallSessionManager, CallTimer, CallTransition, CallUpdate},
    config::CoreConfig,
    error::{ErrorCode, RelayError},
    merge::{DocumentAccess, MergeEngine, MergeOutcome, MergeResult},
    mesh::MeshCoordinator,
    metrics::CoreGauges,
    presence::{PresenceDecision, PresenceFlush, PresenceTracker},
    rooms::{ConnectionTable, OutboundSender, RoomRegistry},
    signaling::SignalingRelay,
    store::{retry::persist_with_retry, retry::spawn_persist, Stores},
    timer::TimerSink,
    ws::{HEARTBEAT_INTERVAL, MAX_FRAME_BYTES},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Call(CallTimer),
    PresenceFlush(PresenceFlush),
}

/// Outcome of fetching a stored document.
#[derive(Debug)]
pub enum DocumentLoad {
    /// The store answered; `None` means nothing was saved yet.
    Loaded(Option<DocumentSnapshot>),
    /// Every attempt failed. The stored state is unknown.
    Failed,
}

#[derive(Debug)]
pub enum CoreCommand {
    Connect {
        identity: Identity,
        outbound: OutboundSender,
        respond_to: oneshot::Sender<ConnectionId>,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    Client {
        connection_id: ConnectionId,
        event: ClientEvent,
    },
    Timer(TimerEvent),
    DocumentLoaded {
        room_key: RoomKey,
        load: DocumentLoad,
    },
    Sweep,
    Shutdown,
}

/// Cheap, cloneable entry point into the core task.
#[derive(Clone)]
pub struct CoreHandle {
    commands: mpsc::UnboundedSender<CoreCommand>,
}

impl CoreHandle {
    /// Registers a socket. `None` once the core has stopped.
    pub async fn connect(&self, identity: Identity, outbound: OutboundSender) -> Option<ConnectionId> {
        let (respond_to, response) = oneshot::channel();
        self.commands.send(CoreCommand::Connect { identity, outbound, respond_to }).ok()?;
        response.await.ok()
    }

    pub fn disconnect(&self, connection_id: ConnectionId) {
        let _ = self.commands.send(CoreCommand::Disconnect { connection_id });
    }

    pub fn dispatch(&self, connection_id: ConnectionId, event: ClientEvent) -> bool {
        self.commands.send(CoreCommand::Client { connection_id, event }).is_ok()
    }

    pub fn sweep(&self) -> bool {
        self.commands.send(CoreCommand::Sweep).is_ok()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(CoreCommand::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn from_sender(commands: mpsc::UnboundedSender<CoreCommand>) -> Self {
        Self { commands }
    }
}

/// Starts the core task. It stops on [`CoreHandle::shutdown`] or once every
/// handle is dropped.
pub fn spawn_core(config: CoreConfig, stores: Stores) -> (CoreHandle, JoinHandle<()>) {
    let (commands, receiver) = mpsc::unbounded_channel();
    let core = RealtimeCore::new(config, stores, commands.downgrade());
    let task = tokio::spawn(core.run(receiver));
    (CoreHandle { commands }, task)
}

pub struct RealtimeCore {
    pub(crate) config: CoreConfig,
    stores: Stores,
    commands: mpsc::WeakUnboundedSender<CoreCommand>,
    pub(crate) connections: ConnectionTable,
    pub(crate) rooms: RoomRegistry,
    pub(crate) presence: PresenceTracker,
    signaling: SignalingRelay,
    pub(crate) calls: CallSessionManager,
    mesh: MeshCoordinator,
    pub(crate) documents: MergeEngine,
}

impl RealtimeCore {
    pub fn new(
        config: CoreConfig,
        stores: Stores,
        commands: mpsc::WeakUnboundedSender<CoreCommand>,
    ) -> Self {
        let presence = PresenceTracker::new(
            config.presence_throttle,
            config.online_users_interval,
            timer_sink(commands.clone(), TimerEvent::PresenceFlush),
        );
        let calls = CallSessionManager::new(
            config.ring_timeout,
            config.call_monitor_interval,
            timer_sink(commands.clone(), TimerEvent::Call),
        );
        let documents = MergeEngine::new(config.max_doc_payload_bytes);
        Self {
            config,
            stores,
            commands,
            connections: ConnectionTable::default(),
            rooms: RoomRegistry::default(),
            presence,
            signaling: SignalingRelay::default(),
            calls,
            mesh: MeshCoordinator::default(),
            documents,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CoreCommand>) {
        info!("realtime core started");
        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        self.flush_documents().await;
        info!(connections = self.connections.len(), live_calls = self.calls.live_count(), "realtime core stopped");
    }

    /// Handles one command. Returns false when the core should stop.
    pub fn handle(&mut self, command: CoreCommand) -> bool {
        let now = Instant::now();
        let at = Utc::now();
        match command {
            CoreCommand::Connect { identity, outbound, respond_to } => {
                let connection_id = self.connect(identity, outbound, now, at);
                if respond_to.send(connection_id).is_err() {
                    self.disconnect(connection_id, now, at);
                }
            }
            CoreCommand::Disconnect { connection_id } => self.disconnect(connection_id, now, at),
            CoreCommand::Client { connection_id, event } => self.dispatch(connection_id, event, now, at),
            CoreCommand::Timer(TimerEvent::Call(timer)) => {
                let rooms = &self.rooms;
                let connections = &self.connections;
                let update = self.calls.on_timer(
                    timer,
                    |call_id, user_id| is_live_in_call(rooms, connections, call_id, user_id),
                    at,
                );
                if let Some(update) = update {
                    self.apply_call_update(update, None);
                }
            }
            CoreCommand::Timer(TimerEvent::PresenceFlush(flush)) => {
                if let Some(change) = self.presence.flush(flush, now) {
                    self.broadcast_presence(change.user_id, change.online, change.last_seen_at);
                }
            }
            CoreCommand::DocumentLoaded { room_key, load: DocumentLoad::Loaded(snapshot) } => {
                self.install_document(room_key, snapshot, at)
            }
            CoreCommand::DocumentLoaded { room_key, load: DocumentLoad::Failed } => {
                self.abandon_document(&room_key)
            }
            CoreCommand::Sweep => {
                self.sweep(now, at);
            }
            CoreCommand::Shutdown => return false,
        }
        true
    }

    fn connect(
        &mut self,
        identity: Identity,
        outbound: OutboundSender,
        now: Instant,
        at: DateTime<Utc>,
    ) -> ConnectionId {
        let connection_id = Uuid::new_v4();
        let user_id = identity.user_id;
        let _ = outbound.send(ServerEvent::Connected {
            connection_id,
            user_id,
            display_name: identity.display_name.clone(),
            protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            server_time: at,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL.as_millis() as u64,
            max_frame_bytes: MAX_FRAME_BYTES,
        });

        let first = self.connections.insert(connection_id, identity, outbound, at);
        info!(connection_id = %connection_id, user_id = %user_id, first, "connection opened");
        if first {
            self.set_presence(user_id, true, now, at);
        }
        connection_id
    }

    /// Releases every membership of the connection, then drops it.
    pub(crate) fn disconnect(&mut self, connection_id: ConnectionId, now: Instant, at: DateTime<Utc>) {
        let Some(user_id) = self.connections.user_of(connection_id) else {
            return;
        };
        for room_key in self.rooms.leave_all(connection_id) {
            self.on_room_left(&room_key, connection_id, user_id, at);
        }
        for left in self.mesh.leave_connection(connection_id) {
            self.announce_mesh_leave(&left.meeting_id, left.user_id, &left.remaining);
        }
        self.presence.forget_connection(connection_id);

        if let Some((_, last)) = self.connections.remove(connection_id) {
            info!(connection_id = %connection_id, user_id = %user_id, last, "connection closed");
            if last {
                self.set_presence(user_id, false, now, at);
            }
        }
    }

    // ── Rooms ────────────────────────────────────────────────────────

    /// Joins `room_key` with all side effects: implicit leave of the previous
    /// room of that kind, announcements, signaling index and document state.
    fn join_room(&mut self, connection_id: ConnectionId, room_key: &RoomKey, at: DateTime<Utc>) {
        if let Some(member) = self.enter_room(connection_id, room_key, at) {
            self.announce_member(room_key, connection_id, member);
        }
    }

    /// The joiner's half of a join: membership, signaling index, the member
    /// list and document state. Returns the member to announce when the
    /// membership is new; the caller decides when the room hears about it.
    fn enter_room(
        &mut self,
        connection_id: ConnectionId,
        room_key: &RoomKey,
        at: DateTime<Utc>,
    ) -> Option<MemberInfo> {
        let member = self.connections.member_info(connection_id)?;
        let outcome = self.rooms.join(room_key, connection_id);
        if let Some(previous) = outcome.left {
            self.on_room_left(&previous, connection_id, member.user_id, at);
        }
        if outcome.newly_joined {
            self.signaling.register(room_key, member.user_id, connection_id);
            debug!(connection_id = %connection_id, room_key = %room_key, "joined room");
        }

        let members = self
            .rooms
            .members_of(room_key)
            .into_iter()
            .filter_map(|member_id| self.connections.member_info(member_id))
            .collect();
        self.connections
            .send(connection_id, ServerEvent::ActiveMembers { room_key: room_key.clone(), members });

        if room_key.kind().is_collaborative() {
            match self.documents.open(room_key) {
                DocumentAccess::Ready(snapshot) => {
                    self.connections.send(connection_id, ServerEvent::DocState { snapshot });
                }
                DocumentAccess::Loading { first_request } => {
                    if first_request {
                        self.load_document(room_key.clone());
                    }
                }
            }
        }
        outcome.newly_joined.then_some(member)
    }

    fn announce_member(&self, room_key: &RoomKey, connection_id: ConnectionId, member: MemberInfo) {
        self.rooms.broadcast(
            room_key,
            &ServerEvent::MemberJoined { room_key: room_key.clone(), member },
            Some(connection_id),
            &self.connections,
        );
    }

    /// Side effects of a connection leaving a room, whatever the cause.
    fn on_room_left(
        &mut self,
        room_key: &RoomKey,
        connection_id: ConnectionId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) {
        self.release_membership(room_key, connection_id, user_id);

        if room_key.kind() == RoomKind::Call {
            let still_in_room = self
                .connections
                .connections_of(user_id)
                .into_iter()
                .any(|other| self.rooms.contains(room_key, other));
            let Ok(call_id) = Uuid::parse_str(room_key.id()) else {
                return;
            };
            if !still_in_room && self.calls.get(call_id).is_some() {
                match self.calls.leave(call_id, user_id, at) {
                    Ok(update) => self.apply_call_update(update, None),
                    Err(error) => {
                        debug!(call_id = %call_id, user_id = %user_id, error = %error, "implicit call leave skipped")
                    }
                }
            }
        }
    }

    /// Announces the departure and drops signaling and mesh entries. The
    /// registry membership must already be gone.
    fn release_membership(&mut self, room_key: &RoomKey, connection_id: ConnectionId, user_id: UserId) {
        self.rooms.broadcast(
            room_key,
            &ServerEvent::MemberLeft { room_key: room_key.clone(), user_id, connection_id },
            None,
            &self.connections,
        );
        self.signaling.unregister(room_key, user_id, connection_id);
        if room_key.kind() == RoomKind::Meeting {
            if let Some(left) = self.mesh.leave(room_key.id(), user_id, connection_id) {
                self.announce_mesh_leave(&left.meeting_id, left.user_id, &left.remaining);
            }
        }
        debug!(connection_id = %connection_id, room_key = %room_key, "left room");
    }

    fn announce_mesh_leave(&self, meeting_id: &str, user_id: UserId, remaining: &[MeshPeer]) {
        for peer in remaining {
            self.connections.send(
                peer.connection_id,
                ServerEvent::UserLeft { meeting_id: meeting_id.to_string(), user_id },
            );
        }
    }

    // ── Presence ─────────────────────────────────────────────────────

    fn set_presence(&mut self, user_id: UserId, online: bool, now: Instant, at: DateTime<Utc>) {
        let decision = if online {
            self.presence.set_online(user_id, now, at)
        } else {
            self.presence.set_offline(user_id, now, at)
        };
        if let PresenceDecision::Broadcast(change) = decision {
            self.broadcast_presence(change.user_id, change.online, change.last_seen_at);
        }

        let users = self.stores.users.clone();
        if online {
            spawn_persist("user.set_online", move || {
                let users = users.clone();
                async move { users.set_online(user_id, at).await }
            });
        } else {
            spawn_persist("user.set_offline", move || {
                let users = users.clone();
                async move { users.set_offline(user_id, at).await }
            });
        }
    }

    fn broadcast_presence(&self, user_id: UserId, online: bool, last_seen_at: DateTime<Utc>) {
        let sent = self
            .connections
            .send_to_all(&ServerEvent::PresenceChanged { user_id, online, last_seen_at });
        debug!(user_id = %user_id, online, recipients = sent, "presence broadcast");
    }

    // ── Calls ────────────────────────────────────────────────────────

    /// Fans a call event out to every participant's connections and every
    /// member of the call room, each connection at most once.
    fn notify_call(&self, call: &CallSnapshot, event: &ServerEvent) -> usize {
        let mut recipients: BTreeSet<ConnectionId> =
            self.rooms.members_of(&call.room_key()).into_iter().collect();
        for participant in &call.participants {
            recipients.extend(self.connections.connections_of(participant.user_id));
        }
        recipients
            .into_iter()
            .filter(|connection_id| self.connections.send(*connection_id, event.clone()))
            .count()
    }

    pub(crate) fn apply_call_update(&mut self, update: CallUpdate, event: Option<ServerEvent>) {
        match update.transition {
            CallTransition::Unchanged => {}
            CallTransition::Updated { .. } => {
                if let Some(event) = event {
                    self.notify_call(&update.snapshot, &event);
                }
                self.persist_call(update.snapshot);
            }
            CallTransition::Terminated(reason) => self.finish_call(update.snapshot, reason),
        }
    }

    /// Announces the end of a call and dissolves its room.
    fn finish_call(&mut self, call: CallSnapshot, reason: CallEndReason) {
        self.notify_call(
            &call,
            &ServerEvent::CallEnded { call_id: call.call_id, status: call.status, reason },
        );

        let room_key = call.room_key();
        for connection_id in self.rooms.members_of(&room_key) {
            self.rooms.leave(&room_key, connection_id);
            if let Some(user_id) = self.connections.user_of(connection_id) {
                self.signaling.unregister(&room_key, user_id, connection_id);
            }
        }
        self.persist_call(call);
    }

    fn persist_call(&self, call: CallSnapshot) {
        let store = self.stores.calls.clone();
        spawn_persist("call.save", move || {
            let store = store.clone();
            let call = call.clone();
            async move { store.save(&call).await }
        });
    }

    /// Answers an operation on a call the live registry does not know. The
    /// frozen record, if any, tells the client how the call ended.
    fn report_unknown_call(&self, connection_id: ConnectionId, call_id: CallId) {
        let Some(outbound) = self.connections.outbound(connection_id) else {
            return;
        };
        let store = self.stores.calls.clone();
        tokio::spawn(async move {
            let details = match store.find_by_id(call_id).await {
                Ok(Some(record)) => json!({ "call_id": call_id, "status": record.status.as_str() }),
                Ok(None) => json!({ "call_id": call_id }),
                Err(error) => {
                    warn!(call_id = %call_id, error = %error, "call record lookup failed");
                    json!({ "call_id": call_id })
                }
            };
            let error = RelayError::new(ErrorCode::NotFound, "call is not live").with_details(details);
            let _ = outbound.send(error.to_event());
        });
    }

    // ── Documents ────────────────────────────────────────────────────

    fn load_document(&self, room_key: RoomKey) {
        let store = self.stores.documents.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let key = room_key.clone();
            let load = match persist_with_retry("document.load", move || {
                let store = store.clone();
                let key = key.clone();
                async move { store.load_document(&key).await }
            })
            .await
            {
                Some(snapshot) => DocumentLoad::Loaded(snapshot),
                None => DocumentLoad::Failed,
            };
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(CoreCommand::DocumentLoaded { room_key, load });
            }
        });
    }

    fn install_document(
        &mut self,
        room_key: RoomKey,
        stored: Option<DocumentSnapshot>,
        at: DateTime<Utc>,
    ) {
        let Some((snapshot, queued)) = self.documents.install(&room_key, stored) else {
            return;
        };
        debug!(room_key = %room_key, version = snapshot.version, queued = queued.len(), "document loaded");
        self.rooms.broadcast(&room_key, &ServerEvent::DocState { snapshot }, None, &self.connections);

        for update in queued {
            let connection_id = update.connection_id;
            let user_id = update.user_id;
            match self.documents.merge_operation(&room_key, update, at) {
                Ok(MergeResult::Merged(outcome)) => {
                    self.publish_merge(&room_key, connection_id, user_id, outcome)
                }
                Ok(MergeResult::Queued { .. }) => {}
                Err(error) => {
                    self.connections.send(connection_id, error.to_relay_error().to_event());
                }
            }
        }
    }

    /// A load that failed must not fall back to an empty document: edits on
    /// top of it would later overwrite the stored one. Queued updates are
    /// refused and the room is told to retry; the next update reloads.
    fn abandon_document(&mut self, room_key: &RoomKey) {
        let queued = self.documents.abandon_load(room_key);
        warn!(room_key = %room_key, refused = queued.len(), "document load failed");

        let error = RelayError::new(ErrorCode::InternalError, "document could not be loaded, retry later")
            .with_details(json!({ "room_key": room_key.to_string() }))
            .to_event();
        let mut notified = BTreeSet::new();
        for connection_id in self.rooms.members_of(room_key) {
            if notified.insert(connection_id) {
                self.connections.send(connection_id, error.clone());
            }
        }
        for update in queued {
            if notified.insert(update.connection_id) {
                self.connections.send(update.connection_id, error.clone());
            }
        }
    }

    /// Acks the sender, rebroadcasts an applied change, then persists.
    fn publish_merge(
        &self,
        room_key: &RoomKey,
        connection_id: ConnectionId,
        user_id: UserId,
        outcome: MergeOutcome,
    ) {
        self.connections.send(
            connection_id,
            ServerEvent::DocAck {
                room_key: room_key.clone(),
                version: outcome.version,
                applied: outcome.applied,
            },
        );
        if !outcome.applied {
            return;
        }
        self.rooms.broadcast(
            room_key,
            &ServerEvent::DocUpdate {
                room_key: room_key.clone(),
                version: outcome.version,
                op: outcome.op,
                modified_by: user_id,
            },
            Some(connection_id),
            &self.connections,
        );
        if let Some(snapshot) = self.documents.snapshot(room_key) {
            self.persist_document(snapshot);
        }
    }

    pub(crate) fn persist_document(&self, snapshot: DocumentSnapshot) {
        let store = self.stores.documents.clone();
        let snapshot = Arc::new(snapshot);
        spawn_persist("document.save", move || {
            let store = store.clone();
            let snapshot = Arc::clone(&snapshot);
            async move { store.save_document(&snapshot).await }
        });
    }

    /// Final write of every edited document. Awaited so shutdown does not
    /// outrun it.
    async fn flush_documents(&mut self) {
        for snapshot in self.documents.unload_unwatched(|_| false) {
            let store = self.stores.documents.clone();
            let snapshot = Arc::new(snapshot);
            persist_with_retry("document.flush", move || {
                let store = store.clone();
                let snapshot = Arc::clone(&snapshot);
                async move { store.save_document(&snapshot).await }
            })
            .await;
        }
    }

    pub(crate) fn gauges(&self) -> CoreGauges {
        CoreGauges {
            connections: self.connections.len() as u64,
            rooms: self.rooms.room_count() as u64,
            live_calls: self.calls.live_count() as u64,
            meshes: self.mesh.mesh_count() as u64,
            documents_loaded: self.documents.loaded_count() as u64,
        }
    }
}

/// A joined participant counts as live while one of their connections is a
/// member of the call room.
pub(crate) fn is_live_in_call(
    rooms: &RoomRegistry,
    connections: &ConnectionTable,
    call_id: CallId,
    user_id: UserId,
) -> bool {
    let room_key = RoomKey::for_call(call_id);
    connections
        .connections_of(user_id)
        .into_iter()
        .any(|connection_id| rooms.contains(&room_key, connection_id))
}

fn timer_sink<M: 'static>(
    commands: mpsc::WeakUnboundedSender<CoreCommand>,
    wrap: fn(M) -> TimerEvent,
) -> TimerSink<M> {
    Arc::new(move |message| match commands.upgrade() {
        Some(commands) => commands.send(CoreCommand::Timer(wrap(message))).is_ok(),
        None => false,
    })
}
