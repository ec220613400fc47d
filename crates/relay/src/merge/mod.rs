//! Deterministic merge of whiteboard and document mutations.
//!
//! Shapes are first-writer-wins by id, canvas metadata is last-writer-wins
//! per key. Every accepted mutation bumps the document version by exactly
//! one; a mutation that changes nothing is acknowledged without a bump.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use huddle_common::types::{ConnectionId, DocOperation, DocumentSnapshot, RoomKey, Shape, UserId};
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::{ErrorCode, RelayError};

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("payload of {actual_bytes} bytes exceeds the {max_bytes} byte limit")]
    PayloadTooLarge { max_bytes: usize, actual_bytes: usize },
    #[error("failed to measure payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MergeError {
    pub fn to_relay_error(&self) -> RelayError {
        match self {
            Self::PayloadTooLarge { max_bytes, actual_bytes } => {
                RelayError::new(ErrorCode::PayloadTooLarge, self.to_string())
                    .with_details(json!({ "max_bytes": max_bytes, "actual_bytes": actual_bytes }))
            }
            Self::Serialization(_) => RelayError::new(ErrorCode::InvalidMessage, self.to_string()),
        }
    }
}

/// Result of merging one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub applied: bool,
    pub version: u64,
    /// The effective change: dropped duplicates removed, server ids filled in.
    pub op: DocOperation,
}

/// In-memory state of one collaborative document.
#[derive(Debug, Clone)]
pub struct DocumentState {
    room_key: RoomKey,
    version: u64,
    /// Version the state had when it was loaded or created.
    loaded_version: u64,
    shapes: Vec<Shape>,
    shape_ids: HashSet<String>,
    canvas: Map<String, Value>,
    last_modified_by: Option<UserId>,
    last_modified_at: Option<DateTime<Utc>>,
}

impl DocumentState {
    pub fn empty(room_key: RoomKey) -> Self {
        Self {
            room_key,
            version: 0,
            loaded_version: 0,
            shapes: Vec::new(),
            shape_ids: HashSet::new(),
            canvas: Map::new(),
            last_modified_by: None,
            last_modified_at: None,
        }
    }

    pub fn from_snapshot(snapshot: DocumentSnapshot) -> Self {
        let mut state = Self::empty(snapshot.room_key);
        state.version = snapshot.version;
        state.loaded_version = snapshot.version;
        state.canvas = snapshot.canvas;
        state.last_modified_by = snapshot.last_modified_by;
        state.last_modified_at = snapshot.last_modified_at;
        for shape in snapshot.shapes {
            state.push_shape(shape);
        }
        state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// True once a mutation was accepted after the load.
    pub fn is_dirty(&self) -> bool {
        self.version != self.loaded_version
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            room_key: self.room_key.clone(),
            version: self.version,
            shapes: self.shapes.clone(),
            canvas: self.canvas.clone(),
            last_modified_by: self.last_modified_by,
            last_modified_at: self.last_modified_at,
        }
    }

    /// Applies `op` unless its serialized size exceeds `max_bytes`, in which
    /// case the state is left untouched.
    pub fn merge_operation(
        &mut self,
        op: DocOperation,
        max_bytes: usize,
        modified_by: UserId,
        at: DateTime<Utc>,
    ) -> Result<MergeOutcome, MergeError> {
        let actual_bytes = serde_json::to_vec(&op)?.len();
        if actual_bytes > max_bytes {
            return Err(MergeError::PayloadTooLarge { max_bytes, actual_bytes });
        }

        let effective = match op {
            DocOperation::AddShapes { shapes } => {
                let mut added = Vec::new();
                for mut shape in shapes {
                    let id = shape.id.get_or_insert_with(|| Uuid::new_v4().to_string()).clone();
                    if self.shape_ids.contains(&id) {
                        debug!(room_key = %self.room_key, shape_id = %id, "dropping duplicate shape");
                        continue;
                    }
                    self.push_shape(shape.clone());
                    added.push(shape);
                }
                DocOperation::AddShapes { shapes: added }
            }
            DocOperation::Canvas { metadata } => {
                let mut changed = Map::new();
                for (key, value) in metadata {
                    if self.canvas.get(&key) != Some(&value) {
                        self.canvas.insert(key.clone(), value.clone());
                        changed.insert(key, value);
                    }
                }
                DocOperation::Canvas { metadata: changed }
            }
            DocOperation::RemoveShapes { ids } => {
                let mut removed = Vec::new();
                for id in ids {
                    if self.shape_ids.remove(&id) {
                        self.shapes.retain(|shape| shape.id.as_deref() != Some(id.as_str()));
                        removed.push(id);
                    }
                }
                DocOperation::RemoveShapes { ids: removed }
            }
        };

        let applied = !effective.is_noop();
        if applied {
            self.version += 1;
            self.last_modified_by = Some(modified_by);
            self.last_modified_at = Some(at);
        }
        Ok(MergeOutcome { applied, version: self.version, op: effective })
    }

    fn push_shape(&mut self, mut shape: Shape) {
        let id = shape.id.get_or_insert_with(|| Uuid::new_v4().to_string()).clone();
        if self.shape_ids.insert(id) {
            self.shapes.push(shape);
        }
    }
}

/// An update received while its document was still loading.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedUpdate {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub op: DocOperation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentAccess {
    Ready(DocumentSnapshot),
    /// The stored snapshot is being fetched. `first_request` is true exactly
    /// once per load, telling the caller to start it.
    Loading { first_request: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeResult {
    Merged(MergeOutcome),
    Queued { first_request: bool },
}

#[derive(Debug)]
enum DocumentSlot {
    Loading(Vec<QueuedUpdate>),
    Ready(DocumentState),
}

/// Every document currently held in memory, keyed by room.
pub struct MergeEngine {
    max_payload_bytes: usize,
    documents: HashMap<RoomKey, DocumentSlot>,
}

impl MergeEngine {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes, documents: HashMap::new() }
    }

    pub fn open(&mut self, room_key: &RoomKey) -> DocumentAccess {
        match self.documents.get(room_key) {
            Some(DocumentSlot::Ready(state)) => DocumentAccess::Ready(state.snapshot()),
            Some(DocumentSlot::Loading(_)) => DocumentAccess::Loading { first_request: false },
            None => {
                self.documents.insert(room_key.clone(), DocumentSlot::Loading(Vec::new()));
                DocumentAccess::Loading { first_request: true }
            }
        }
    }

    /// Completes a load. Returns the live snapshot and the updates that
    /// arrived meanwhile, or `None` when the document was not loading.
    pub fn install(
        &mut self,
        room_key: &RoomKey,
        stored: Option<DocumentSnapshot>,
    ) -> Option<(DocumentSnapshot, Vec<QueuedUpdate>)> {
        let queued = match self.documents.get_mut(room_key) {
            Some(DocumentSlot::Loading(queued)) => std::mem::take(queued),
            _ => return None,
        };
        let state = match stored {
            Some(snapshot) if &snapshot.room_key == room_key => DocumentState::from_snapshot(snapshot),
            _ => DocumentState::empty(room_key.clone()),
        };
        let snapshot = state.snapshot();
        self.documents.insert(room_key.clone(), DocumentSlot::Ready(state));
        Some((snapshot, queued))
    }

    /// Gives up on a pending load. The slot is dropped so the next open or
    /// update starts a fresh load; the updates queued behind it are returned
    /// unapplied.
    pub fn abandon_load(&mut self, room_key: &RoomKey) -> Vec<QueuedUpdate> {
        if !matches!(self.documents.get(room_key), Some(DocumentSlot::Loading(_))) {
            return Vec::new();
        }
        match self.documents.remove(room_key) {
            Some(DocumentSlot::Loading(queued)) => queued,
            _ => Vec::new(),
        }
    }

    /// Merges into a loaded document, or queues behind a pending load. The
    /// size guard runs first either way.
    pub fn merge_operation(
        &mut self,
        room_key: &RoomKey,
        update: QueuedUpdate,
        at: DateTime<Utc>,
    ) -> Result<MergeResult, MergeError> {
        let first_request = match self.documents.get_mut(room_key) {
            Some(DocumentSlot::Ready(state)) => {
                return state
                    .merge_operation(update.op, self.max_payload_bytes, update.user_id, at)
                    .map(MergeResult::Merged);
            }
            Some(DocumentSlot::Loading(_)) => false,
            None => true,
        };

        let actual_bytes = serde_json::to_vec(&update.op)?.len();
        if actual_bytes > self.max_payload_bytes {
            return Err(MergeError::PayloadTooLarge { max_bytes: self.max_payload_bytes, actual_bytes });
        }
        match self.documents.entry(room_key.clone()).or_insert_with(|| DocumentSlot::Loading(Vec::new())) {
            DocumentSlot::Loading(queued) => queued.push(update),
            DocumentSlot::Ready(_) => {}
        }
        Ok(MergeResult::Queued { first_request })
    }

    pub fn snapshot(&self, room_key: &RoomKey) -> Option<DocumentSnapshot> {
        match self.documents.get(room_key) {
            Some(DocumentSlot::Ready(state)) => Some(state.snapshot()),
            _ => None,
        }
    }

    /// Drops loaded documents nobody watches. Returns the snapshots that
    /// carry edits, for a final persist.
    pub fn unload_unwatched(&mut self, watched: impl Fn(&RoomKey) -> bool) -> Vec<DocumentSnapshot> {
        let unwatched: Vec<RoomKey> = self
            .documents
            .iter()
            .filter(|(room_key, slot)| matches!(slot, DocumentSlot::Ready(_)) && !watched(room_key))
            .map(|(room_key, _)| room_key.clone())
            .collect();

        let mut snapshots = Vec::new();
        for room_key in unwatched {
            if let Some(DocumentSlot::Ready(state)) = self.documents.remove(&room_key) {
                if state.is_dirty() {
                    snapshots.push(state.snapshot());
                }
            }
        }
        snapshots
    }

    pub fn loaded_count(&self) -> usize {
        self.documents.len()
    }
}
