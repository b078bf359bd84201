//! Integration tests for embedded migrations and connection pooling.

use sqlx::Row;

use corral_db::config::DbConfig;
use corral_db::pool;
use corral_test_utils::{create_test_db, drop_test_db, pg_url};

const EXPECTED_TABLES: &[&str] = &["agent_pools", "agents", "leases", "tasks", "workspaces"];

#[tokio::test]
async fn migrations_create_all_tables() {
    let (pool, db_name) = create_test_db().await;

    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' AND tablename NOT LIKE '\\_sqlx%' \
         ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .expect("should list tables");

    let names: Vec<&str> = rows.iter().map(|(n,)| n.as_str()).collect();
    assert_eq!(names, EXPECTED_TABLES);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, db_name) = create_test_db().await;

    pool::run_migrations(&pool)
        .await
        .expect("second migration run should be a no-op");

    for table in EXPECTED_TABLES {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS cnt FROM {table}"))
            .fetch_one(&pool)
            .await
            .unwrap_or_else(|e| panic!("failed to count {table}: {e}"));
        let count: i64 = row.get("cnt");
        assert_eq!(count, 0, "table {table} should be empty");
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn table_counts_lists_every_table() {
    let (pool, db_name) = create_test_db().await;

    let counts = pool::table_counts(&pool).await.expect("table_counts");
    let names: Vec<&str> = counts.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, EXPECTED_TABLES);
    assert!(counts.iter().all(|(_, c)| *c == 0));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn queued_task_with_agent_is_rejected() {
    let (pool, db_name) = create_test_db().await;
    corral_test_utils::seed_pool_and_workspace(&pool, "p1", "ws1").await;

    let result = sqlx::query(
        "INSERT INTO tasks (workspace_id, pool_id, action, task_type, status, assigned_agent) \
         VALUES ('ws1', 'p1', 'plan', 'plan', 'queued', 'agent-x')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "queued rows must not carry an assigned agent");

    let result = sqlx::query(
        "INSERT INTO tasks (workspace_id, pool_id, action, task_type, status) \
         VALUES ('ws1', 'p1', 'plan', 'plan', 'dispatched')",
    )
    .execute(&pool)
    .await;
    assert!(result.is_err(), "dispatched rows must carry an assigned agent");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn ensure_database_exists_is_idempotent() {
    let db_name = format!("corral_test_ensure_{}", std::process::id());
    let config = DbConfig::new(format!("{}/{db_name}", pg_url().await));

    let created = pool::ensure_database_exists(&config)
        .await
        .expect("first ensure should create the database");
    assert!(created);
    let created = pool::ensure_database_exists(&config)
        .await
        .expect("second ensure should be a no-op");
    assert!(!created);

    let conn = pool::connect_with_retry(&config, 1).await.expect("connect");
    conn.close().await;

    drop_test_db(&db_name).await;
}
