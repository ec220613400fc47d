use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredPresence {
    pub online: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// User identity and presence persistence.
#[derive(Clone)]
pub enum UserStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryUserStore>>),
}

#[derive(Default)]
pub struct MemoryUserStore {
    profiles: HashMap<Uuid, UserProfile>,
    presence: HashMap<Uuid, StoredPresence>,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    display_name: String,
}

impl UserStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryUserStore::default())))
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, UserRow>(
                    "SELECT id, display_name FROM users WHERE id = $1",
                )
                .bind(user_id)
                .fetch_optional(pool)
                .await?;
                Ok(row.map(|row| UserProfile { id: row.id, display_name: row.display_name }))
            }
            Self::Memory(store) => Ok(store.read().await.profiles.get(&user_id).cloned()),
        }
    }

    pub async fn set_online(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_presence(user_id, true, at).await
    }

    pub async fn set_offline(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.set_presence(user_id, false, at).await
    }

    async fn set_presence(
        &self,
        user_id: Uuid,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                // A retried older write must not overwrite a newer one.
                sqlx::query(
                    r#"
                    INSERT INTO user_presence (user_id, online, last_seen_at)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (user_id) DO UPDATE
                    SET online = EXCLUDED.online, last_seen_at = EXCLUDED.last_seen_at
                    WHERE user_presence.last_seen_at <= EXCLUDED.last_seen_at
                    "#,
                )
                .bind(user_id)
                .bind(online)
                .bind(at)
                .execute(pool)
                .await?;
                Ok(())
            }
            Self::Memory(store) => {
                let mut guard = store.write().await;
                let entry =
                    guard.presence.entry(user_id).or_insert(StoredPresence { online, last_seen_at: at });
                if entry.last_seen_at <= at {
                    *entry = StoredPresence { online, last_seen_at: at };
                }
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub async fn insert_profile(&self, profile: UserProfile) {
        if let Self::Memory(store) = self {
            store.write().await.profiles.insert(profile.id, profile);
        }
    }

    #[cfg(test)]
    pub async fn presence(&self, user_id: Uuid) -> Option<StoredPresence> {
        match self {
            Self::Memory(store) => store.read().await.presence.get(&user_id).copied(),
            Self::Postgres(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn memory_store_returns_inserted_profiles() {
        let store = UserStore::in_memory();
        let id = Uuid::new_v4();
        assert_eq!(store.get_user(id).await.unwrap(), None);

        store.insert_profile(UserProfile { id, display_name: "Grace".into() }).await;
        let profile = store.get_user(id).await.unwrap().expect("profile should exist");
        assert_eq!(profile.display_name, "Grace");
    }

    #[tokio::test]
    async fn older_presence_write_does_not_overwrite_newer() {
        let store = UserStore::in_memory();
        let id = Uuid::new_v4();
        let now = Utc::now();

        store.set_offline(id, now).await.unwrap();
        store.set_online(id, now - Duration::seconds(3)).await.unwrap();

        let stored = store.presence(id).await.expect("presence should be stored");
        assert!(!stored.online);
        assert_eq!(stored.last_seen_at, now);
    }
}
