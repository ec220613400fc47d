// Durable collaborators of the real-time core.
//
// Every store is an enum over a PostgreSQL pool and an in-memory map so the
// relay runs without a database in development and in tests. Calls into a
// store never happen on the gateway task; the gateway snapshots state and
// hands it to `retry::persist_with_retry` in a spawned task.

pub mod calls;
pub mod documents;
pub mod retry;
pub mod users;

use sqlx::PgPool;

pub use calls::CallStore;
pub use documents::DocumentStore;
pub use users::{UserProfile, UserStore};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored record is malformed: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct Stores {
    pub users: UserStore,
    pub calls: CallStore,
    pub documents: DocumentStore,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            users: UserStore::Postgres(pool.clone()),
            calls: CallStore::Postgres(pool.clone()),
            documents: DocumentStore::Postgres(pool),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            users: UserStore::in_memory(),
            calls: CallStore::in_memory(),
            documents: DocumentStore::in_memory(),
        }
    }
}
