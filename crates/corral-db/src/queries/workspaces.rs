//! Database query functions for the `workspaces` table.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use sqlx::PgPool;

use crate::models::{DriftStatus, Workspace};

/// Drift-check settings applied with [`update_drift_settings`].
#[derive(Debug, Clone)]
pub struct DriftSettings {
    pub enabled: bool,
    pub interval_minutes: i32,
    pub window_start: Option<NaiveTime>,
    pub window_end: Option<NaiveTime>,
    pub continue_on_success: bool,
    pub continue_on_failure: bool,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 1440,
            window_start: None,
            window_end: None,
            continue_on_success: true,
            continue_on_failure: true,
        }
    }
}

/// Insert a new workspace bound to `pool_id`.
pub async fn insert_workspace(
    pool: &PgPool,
    workspace_id: &str,
    name: &str,
    pool_id: Option<&str>,
) -> Result<Workspace> {
    let ws = sqlx::query_as::<_, Workspace>(
        "INSERT INTO workspaces (workspace_id, name, pool_id) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(workspace_id)
    .bind(name)
    .bind(pool_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert workspace {workspace_id}"))?;

    Ok(ws)
}

/// Fetch a single workspace by id.
pub async fn get_workspace(pool: &PgPool, workspace_id: &str) -> Result<Option<Workspace>> {
    let ws = sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE workspace_id = $1")
        .bind(workspace_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workspace")?;

    Ok(ws)
}

/// List all workspaces ordered by id.
pub async fn list_workspaces(pool: &PgPool) -> Result<Vec<Workspace>> {
    let rows = sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces ORDER BY workspace_id")
        .fetch_all(pool)
        .await
        .context("failed to list workspaces")?;

    Ok(rows)
}

/// List workspaces with drift checking enabled.
pub async fn list_drift_enabled(pool: &PgPool) -> Result<Vec<Workspace>> {
    let rows = sqlx::query_as::<_, Workspace>(
        "SELECT * FROM workspaces WHERE drift_enabled ORDER BY workspace_id",
    )
    .fetch_all(pool)
    .await
    .context("failed to list drift-enabled workspaces")?;

    Ok(rows)
}

/// Replace a workspace's drift settings.
pub async fn update_drift_settings(
    pool: &PgPool,
    workspace_id: &str,
    settings: &DriftSettings,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workspaces \
         SET drift_enabled = $1, \
             drift_interval_minutes = $2, \
             drift_window_start = $3, \
             drift_window_end = $4, \
             continue_on_success = $5, \
             continue_on_failure = $6 \
         WHERE workspace_id = $7",
    )
    .bind(settings.enabled)
    .bind(settings.interval_minutes)
    .bind(settings.window_start)
    .bind(settings.window_end)
    .bind(settings.continue_on_success)
    .bind(settings.continue_on_failure)
    .bind(workspace_id)
    .execute(pool)
    .await
    .context("failed to update drift settings")?;

    Ok(result.rows_affected())
}

/// Record the drift status of a workspace. `finished_at` is set when a
/// drift check reaches a terminal state and left untouched otherwise.
pub async fn set_drift_status(
    pool: &PgPool,
    workspace_id: &str,
    status: DriftStatus,
    finished_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workspaces \
         SET drift_status = $1, \
             last_drift_at = COALESCE($2, last_drift_at) \
         WHERE workspace_id = $3",
    )
    .bind(status)
    .bind(finished_at)
    .bind(workspace_id)
    .execute(pool)
    .await
    .context("failed to set drift status")?;

    Ok(result.rows_affected())
}
