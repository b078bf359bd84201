//! Test fixtures for corral integration tests.
//!
//! Every test binary shares one PostgreSQL server and each test creates a
//! throwaway database on it. Set `CORRAL_TEST_PG_URL` to point at a running
//! server (CI does); otherwise a testcontainers instance is started on first
//! use and lives as long as the test binary.

use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use corral_db::config::DbConfig;
use corral_db::models::PoolType;
use corral_db::pool;
use corral_db::queries::{pools as pool_db, workspaces as workspace_db};

enum Server {
    External(String),
    Container {
        url: String,
        _handle: ContainerAsync<Postgres>,
    },
}

impl Server {
    fn url(&self) -> &str {
        match self {
            Server::External(url) | Server::Container { url, .. } => url,
        }
    }
}

static SERVER: OnceCell<Server> = OnceCell::const_new();

async fn start_server() -> Server {
    if let Ok(url) = std::env::var("CORRAL_TEST_PG_URL") {
        return Server::External(url.trim_end_matches('/').to_owned());
    }

    let handle = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("failed to start PostgreSQL container");
    let host = handle.get_host().await.expect("container host");
    let port = handle
        .get_host_port_ipv4(5432)
        .await
        .expect("container port");

    Server::Container {
        url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _handle: handle,
    }
}

/// Server URL without a database name.
pub async fn pg_url() -> &'static str {
    SERVER.get_or_init(start_server).await.url()
}

/// Create a fresh, migrated database.
///
/// Returns `(pool, db_name)`; hand `db_name` to [`drop_test_db`] at the end
/// of the test.
pub async fn create_test_db() -> (PgPool, String) {
    let db_name = format!("corral_test_{}", Uuid::new_v4().simple());
    let config = DbConfig::new(format!("{}/{db_name}", pg_url().await));

    pool::ensure_database_exists(&config)
        .await
        .unwrap_or_else(|e| panic!("failed to create {db_name}: {e:#}"));
    let db = pool::create_pool(&config)
        .await
        .unwrap_or_else(|e| panic!("failed to connect to {db_name}: {e:#}"));
    pool::run_migrations(&db).await.expect("migrations should apply");

    (db, db_name)
}

/// Drop a test database, disconnecting anything still attached.
pub async fn drop_test_db(db_name: &str) {
    let admin = DbConfig::new(format!("{}/postgres", pg_url().await));
    let Ok(conn) = pool::create_pool(&admin).await else {
        return;
    };
    let _ = conn
        .execute(format!("DROP DATABASE IF EXISTS {db_name} WITH (FORCE)").as_str())
        .await;
    conn.close().await;
}

/// Insert a static pool and a workspace bound to it.
pub async fn seed_pool_and_workspace(pool: &PgPool, pool_id: &str, workspace_id: &str) {
    pool_db::insert_pool(pool, pool_id, pool_id, PoolType::Static, 0)
        .await
        .expect("insert pool");
    workspace_db::insert_workspace(pool, workspace_id, workspace_id, Some(pool_id))
        .await
        .expect("insert workspace");
}
