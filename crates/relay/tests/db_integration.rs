#[path = "../src/db/migrations.rs"]
mod migrations;
#[path = "../src/db/pool.rs"]
mod pool;

use pool::{check_pool_health, create_pg_pool, PoolConfig};

const EXPECTED_TABLES: &[&str] = &["users", "user_presence", "call_records", "document_states"];

async fn test_pool() -> Option<sqlx::PgPool> {
    let Some(database_url) = std::env::var("HUDDLE_RELAY_TEST_DATABASE_URL").ok() else {
        eprintln!("skipping db integration test: set HUDDLE_RELAY_TEST_DATABASE_URL to run it");
        return None;
    };

    let config = PoolConfig { min_connections: 1, max_connections: 2, ..PoolConfig::default() };
    Some(create_pg_pool(&database_url, config).await.expect("pool should connect to test database"))
}

#[tokio::test]
async fn pg_pool_connects_and_passes_health_check() {
    let Some(pool) = test_pool().await else {
        return;
    };

    check_pool_health(&pool).await.expect("health check query should succeed");
}

#[tokio::test]
async fn relay_migrations_create_expected_tables() {
    let Some(pool) = test_pool().await else {
        return;
    };

    migrations::run_migrations(&pool).await.expect("migrations should apply");

    let table_names: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT table_name \
         FROM information_schema.tables \
         WHERE table_schema = 'public'",
    )
    .fetch_all(&pool)
    .await
    .expect("table lookup should succeed");

    for expected_table in EXPECTED_TABLES {
        assert!(
            table_names.iter().any(|name| name == expected_table),
            "expected table `{expected_table}` to exist after migrations"
        );
    }
}
