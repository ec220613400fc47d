use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use huddle_common::types::{CallEndReason, CallId, CallKind, CallParticipant, CallSnapshot, CallStatus};
use sqlx::{types::Json, PgPool};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::StoreError;

/// Durable call records. The live state machine lives in `calls`; this store
/// only ever sees snapshots of it.
#[derive(Clone)]
pub enum CallStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<CallId, CallSnapshot>>>),
}

#[derive(sqlx::FromRow)]
struct CallRow {
    id: Uuid,
    kind: String,
    status: String,
    started_by: Uuid,
    participants: Json<Vec<CallParticipant>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    end_reason: Option<String>,
}

impl TryFrom<CallRow> for CallSnapshot {
    type Error = StoreError;

    fn try_from(row: CallRow) -> Result<Self, Self::Error> {
        let kind = CallKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Malformed(format!("unknown call kind '{}'", row.kind)))?;
        let status = CallStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Malformed(format!("unknown call status '{}'", row.status)))?;
        let end_reason = row
            .end_reason
            .map(|reason| serde_json::from_value::<CallEndReason>(serde_json::Value::String(reason)))
            .transpose()?;

        Ok(CallSnapshot {
            call_id: row.id,
            kind,
            status,
            started_by: row.started_by,
            participants: row.participants.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
            ended_at: row.ended_at,
            end_reason,
        })
    }
}

impl CallStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn create(&self, call: &CallSnapshot) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO call_records
                        (id, kind, status, started_by, participants, created_at, updated_at,
                         ended_at, end_reason)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (id) DO NOTHING
                    "#,
                )
                .bind(call.call_id)
                .bind(call.kind.as_str())
                .bind(call.status.as_str())
                .bind(call.started_by)
                .bind(Json(&call.participants))
                .bind(call.created_at)
                .bind(call.updated_at)
                .bind(call.ended_at)
                .bind(call.end_reason.map(CallEndReason::as_str))
                .execute(pool)
                .await?;
                Ok(())
            }
            Self::Memory(store) => {
                store.write().await.entry(call.call_id).or_insert_with(|| call.clone());
                Ok(())
            }
        }
    }

    pub async fn find_by_id(&self, call_id: CallId) -> Result<Option<CallSnapshot>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, CallRow>(
                    r#"
                    SELECT id, kind, status, started_by, participants, created_at, updated_at,
                           ended_at, end_reason
                    FROM call_records
                    WHERE id = $1
                    "#,
                )
                .bind(call_id)
                .fetch_optional(pool)
                .await?;
                row.map(CallSnapshot::try_from).transpose()
            }
            Self::Memory(store) => Ok(store.read().await.get(&call_id).cloned()),
        }
    }

    /// Upserts the snapshot. A snapshot older than the stored one is ignored
    /// so a slow retry cannot roll a terminal record back.
    pub async fn save(&self, call: &CallSnapshot) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO call_records
                        (id, kind, status, started_by, participants, created_at, updated_at,
                         ended_at, end_reason)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                    ON CONFLICT (id) DO UPDATE
                    SET status = EXCLUDED.status,
                        participants = EXCLUDED.participants,
                        updated_at = EXCLUDED.updated_at,
                        ended_at = EXCLUDED.ended_at,
                        end_reason = EXCLUDED.end_reason
                    WHERE call_records.updated_at <= EXCLUDED.updated_at
                    "#,
                )
                .bind(call.call_id)
                .bind(call.kind.as_str())
                .bind(call.status.as_str())
                .bind(call.started_by)
                .bind(Json(&call.participants))
                .bind(call.created_at)
                .bind(call.updated_at)
                .bind(call.ended_at)
                .bind(call.end_reason.map(CallEndReason::as_str))
                .execute(pool)
                .await?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                match guard.get(&call.call_id) {
                    Some(existing) if existing.updated_at > call.updated_at => {}
                    _ => {
                        guard.insert(call.call_id, call.clone());
                    }
                }
                Ok(())
            }
        }
    }

    /// Deletes every record in one of `statuses`, returning how many went.
    pub async fn delete_many(&self, statuses: &[CallStatus]) -> Result<u64, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let statuses: Vec<&str> = statuses.iter().map(|status| status.as_str()).collect();
                let result = sqlx::query("DELETE FROM call_records WHERE status = ANY($1)")
                    .bind(&statuses[..])
                    .execute(pool)
                    .await?;
                Ok(result.rows_affected())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                let before = guard.len();
                guard.retain(|_, call| !statuses.contains(&call.status));
                Ok((before - guard.len()) as u64)
            }
        }
    }
}
