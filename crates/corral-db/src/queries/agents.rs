//! Database query functions for the `agents` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Agent, AgentStatus};

/// Insert an agent, or return the existing row registered under the same
/// `(name, token_hash)` pair.
///
/// `candidate_id` is only used when a new row is created, so repeated calls
/// with the same name and bearer always yield the first agent id.
pub async fn upsert_agent(
    pool: &PgPool,
    candidate_id: &str,
    name: &str,
    pool_id: &str,
    token_hash: &str,
) -> Result<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (agent_id, name, pool_id, token_hash) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (name, token_hash) DO UPDATE SET name = agents.name \
         RETURNING *",
    )
    .bind(candidate_id)
    .bind(name)
    .bind(pool_id)
    .bind(token_hash)
    .fetch_one(pool)
    .await
    .context("failed to upsert agent")?;

    Ok(agent)
}

/// Fetch a single agent by id.
pub async fn get_agent(pool: &PgPool, agent_id: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE agent_id = $1")
        .bind(agent_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// List all agents, ordered by pool then name.
pub async fn list_agents(pool: &PgPool) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>("SELECT * FROM agents ORDER BY pool_id, name")
        .fetch_all(pool)
        .await
        .context("failed to list agents")?;

    Ok(agents)
}

/// Record a heartbeat timestamp. Older timestamps never overwrite newer ones.
pub async fn mark_seen(pool: &PgPool, agent_id: &str, seen_at: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET last_seen = GREATEST(COALESCE(last_seen, $2), $2) \
         WHERE agent_id = $1",
    )
    .bind(agent_id)
    .bind(seen_at)
    .execute(pool)
    .await
    .context("failed to mark agent seen")?;

    Ok(result.rows_affected())
}

/// Set an agent's liveness status.
pub async fn set_agent_status(pool: &PgPool, agent_id: &str, status: AgentStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE agents SET status = $1 WHERE agent_id = $2")
        .bind(status)
        .bind(agent_id)
        .execute(pool)
        .await
        .context("failed to set agent status")?;

    Ok(result.rows_affected())
}

/// Mark `online` agents offline when their last heartbeat is older than
/// `cutoff`, skipping the ids in `live` (agents with a session on this
/// process). Returns the ids that changed.
pub async fn mark_stale_offline(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    live: &[String],
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "UPDATE agents SET status = 'offline' \
         WHERE status = 'online' \
           AND (last_seen IS NULL OR last_seen < $1) \
           AND NOT (agent_id = ANY($2)) \
         RETURNING agent_id",
    )
    .bind(cutoff)
    .bind(live)
    .fetch_all(pool)
    .await
    .context("failed to mark stale agents offline")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Number of agents in a pool currently marked `online`.
pub async fn count_online_in_pool(pool: &PgPool, pool_id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM agents WHERE pool_id = $1 AND status = 'online'",
    )
    .bind(pool_id)
    .fetch_one(pool)
    .await
    .context("failed to count online agents")?;

    Ok(row.0)
}

/// Delete an agent record. Only reachable through operator action.
pub async fn delete_agent(pool: &PgPool, agent_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM agents WHERE agent_id = $1")
        .bind(agent_id)
        .execute(pool)
        .await
        .context("failed to delete agent")?;

    Ok(result.rows_affected())
}
