use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::{info, warn};

use crate::config::DbConfig;

/// Migrations embedded at compile time from `crates/corral-db/migrations/`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

fn pool_options(max_connections: u32) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
}

/// Create a connection pool sized by the config.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    pool_options(config.max_connections)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.redacted_url()))
}

/// Like [`create_pool`], but keeps trying while the server comes up.
///
/// Coordinator replicas are often scheduled before the database accepts
/// connections; the delay doubles after each failure up to 30s.
pub async fn connect_with_retry(config: &DbConfig, attempts: u32) -> Result<PgPool> {
    let mut delay = Duration::from_millis(500);
    let mut attempt = 1;
    loop {
        match create_pool(config).await {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < attempts => {
                warn!(attempt, error = %format!("{e:#}"), "database not reachable, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Run all pending embedded migrations against the pool.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;

    info!("migrations applied");
    Ok(())
}

/// Create the configured database on its server unless it already exists.
///
/// Returns `true` when the database was created by this call.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<bool> {
    let db_name = config
        .database_name()
        .context("could not determine database name from URL")?;
    if !db_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("database name {db_name:?} may only contain ASCII letters, digits and '_'");
    }

    let admin_config = DbConfig::new(config.maintenance_url());
    let admin = pool_options(1)
        .connect(&admin_config.database_url)
        .await
        .with_context(|| {
            format!("failed to connect to maintenance database at {}", admin_config.redacted_url())
        })?;

    let result = create_if_missing(&admin, db_name).await;
    admin.close().await;
    result
}

async fn create_if_missing(admin: &PgPool, db_name: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(db_name)
            .fetch_one(admin)
            .await
            .context("failed to query pg_database")?;
    if exists {
        info!(db = db_name, "database already exists");
        return Ok(false);
    }

    // CREATE DATABASE takes no bind parameters; the name was checked above.
    admin
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .with_context(|| format!("failed to create database {db_name}"))?;
    info!(db = db_name, "database created");
    Ok(true)
}

/// Row counts for every table in the `public` schema, excluding sqlx's
/// bookkeeping table, sorted by table name.
pub async fn table_counts(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT tablename::text FROM pg_tables \
         WHERE schemaname = 'public' AND tablename NOT LIKE '\\_sqlx%' \
         ORDER BY tablename",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tables")?;
    if tables.is_empty() {
        return Ok(Vec::new());
    }

    // One round trip; names come from pg_tables so they are plain identifiers.
    let query = tables
        .iter()
        .map(|t| format!("SELECT '{t}'::text, COUNT(*) FROM {t}"))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    let mut counts: Vec<(String, i64)> = sqlx::query_as(&query)
        .fetch_all(pool)
        .await
        .context("failed to count table rows")?;
    counts.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(counts)
}
