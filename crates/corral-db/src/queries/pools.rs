//! Database query functions for the `agent_pools` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{AgentPool, PoolType};

/// Insert a new pool. Fails if the id is taken.
pub async fn insert_pool(
    pool: &PgPool,
    pool_id: &str,
    name: &str,
    pool_type: PoolType,
    desired_count: i32,
) -> Result<AgentPool> {
    let row = sqlx::query_as::<_, AgentPool>(
        "INSERT INTO agent_pools (pool_id, name, pool_type, desired_count) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(pool_id)
    .bind(name)
    .bind(pool_type)
    .bind(desired_count)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert pool {pool_id}"))?;

    Ok(row)
}

/// Fetch a single pool by id.
pub async fn get_pool(pool: &PgPool, pool_id: &str) -> Result<Option<AgentPool>> {
    let row = sqlx::query_as::<_, AgentPool>("SELECT * FROM agent_pools WHERE pool_id = $1")
        .bind(pool_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch pool")?;

    Ok(row)
}

/// List all pools ordered by id.
pub async fn list_pools(pool: &PgPool) -> Result<Vec<AgentPool>> {
    let rows = sqlx::query_as::<_, AgentPool>("SELECT * FROM agent_pools ORDER BY pool_id")
        .fetch_all(pool)
        .await
        .context("failed to list pools")?;

    Ok(rows)
}

/// Set the desired agent count of an orchestrated pool.
pub async fn set_desired_count(pool: &PgPool, pool_id: &str, desired_count: i32) -> Result<u64> {
    let result = sqlx::query("UPDATE agent_pools SET desired_count = $1 WHERE pool_id = $2")
        .bind(desired_count)
        .bind(pool_id)
        .execute(pool)
        .await
        .context("failed to update desired count")?;

    Ok(result.rows_affected())
}
