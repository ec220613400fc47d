use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use huddle_common::types::{DocumentSnapshot, RoomKey, Shape};
use serde_json::{Map, Value};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;
use tokio::sync::RwLock;

use super::StoreError;

/// Snapshots of collaborative documents, written after each accepted merge.
#[derive(Clone)]
pub enum DocumentStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<RoomKey, DocumentSnapshot>>>),
}

#[derive(sqlx::FromRow)]
struct DocumentRow {
    room_key: String,
    version: i64,
    shapes: Json<Vec<Shape>>,
    canvas: Json<Map<String, Value>>,
    last_modified_by: Option<Uuid>,
    last_modified_at: Option<DateTime<Utc>>,
}

impl TryFrom<DocumentRow> for DocumentSnapshot {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let room_key = row
            .room_key
            .parse::<RoomKey>()
            .map_err(|error| StoreError::Malformed(format!("room key '{}': {error}", row.room_key)))?;
        let version = u64::try_from(row.version)
            .map_err(|_| StoreError::Malformed(format!("negative document version {}", row.version)))?;
        Ok(DocumentSnapshot {
            room_key,
            version,
            shapes: row.shapes.0,
            canvas: row.canvas.0,
            last_modified_by: row.last_modified_by,
            last_modified_at: row.last_modified_at,
        })
    }
}

impl DocumentStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn load_document(&self, room_key: &RoomKey) -> Result<Option<DocumentSnapshot>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, DocumentRow>(
                    r#"
                    SELECT room_key, version, shapes, canvas, last_modified_by, last_modified_at
                    FROM document_states
                    WHERE room_key = $1
                    "#,
                )
                .bind(room_key.to_string())
                .fetch_optional(pool)
                .await?;
                row.map(DocumentSnapshot::try_from).transpose()
            }
            Self::Memory(store) => Ok(store.read().await.get(room_key).cloned()),
        }
    }

    /// Stores the snapshot unless a newer version is already stored.
    pub async fn save_document(&self, snapshot: &DocumentSnapshot) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                let version = i64::try_from(snapshot.version).map_err(|_| {
                    StoreError::Malformed(format!("document version {} overflows", snapshot.version))
                })?;
                sqlx::query(
                    r#"
                    INSERT INTO document_states
                        (room_key, version, shapes, canvas, last_modified_by, last_modified_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    ON CONFLICT (room_key) DO UPDATE
                    SET version = EXCLUDED.version,
                        shapes = EXCLUDED.shapes,
                        canvas = EXCLUDED.canvas,
                        last_modified_by = EXCLUDED.last_modified_by,
                        last_modified_at = EXCLUDED.last_modified_at
                    WHERE document_states.version < EXCLUDED.version
                    "#,
                )
                .bind(snapshot.room_key.to_string())
                .bind(version)
                .bind(Json(&snapshot.shapes))
                .bind(Json(&snapshot.canvas))
                .bind(snapshot.last_modified_by)
                .bind(snapshot.last_modified_at)
                .execute(pool)
                .await?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                let newer_stored = guard
                    .get(&snapshot.room_key)
                    .is_some_and(|stored| stored.version >= snapshot.version);
                if !newer_stored {
                    guard.insert(snapshot.room_key.clone(), snapshot.clone());
                }
                Ok(())
            }
        }
    }

}
