//! Database query functions for the `tasks` table.
//!
//! Status changes use optimistic locking: every UPDATE names the status it
//! expects to replace and reports the number of rows affected, so callers can
//! tell a lost race (0 rows) from success.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{Task, TaskStatus, TaskType};

/// Insert a new `queued` task. The action is derived from the task type.
pub async fn insert_task(
    pool: &PgPool,
    workspace_id: &str,
    pool_id: &str,
    task_type: TaskType,
    is_drift_check: bool,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (workspace_id, pool_id, action, task_type, is_drift_check) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(workspace_id)
    .bind(pool_id)
    .bind(task_type.action())
    .bind(task_type)
    .bind(is_drift_check)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by id.
pub async fn get_task(pool: &PgPool, id: i64) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List the most recent tasks, optionally filtered by status.
pub async fn list_tasks(pool: &PgPool, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::text IS NULL OR status = $1) \
         ORDER BY id DESC \
         LIMIT $2",
    )
    .bind(status)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// The oldest `queued` tasks of a pool, in enqueue order.
pub async fn queued_for_pool(pool: &PgPool, pool_id: &str, limit: i64) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE pool_id = $1 AND status = 'queued' \
         ORDER BY id ASC \
         LIMIT $2",
    )
    .bind(pool_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to read pool queue")?;

    Ok(tasks)
}

/// Pool ids that currently have at least one `queued` task.
pub async fn pools_with_queued(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT pool_id FROM tasks WHERE status = 'queued' ORDER BY pool_id",
    )
    .fetch_all(pool)
    .await
    .context("failed to list pools with queued tasks")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// All tasks currently `dispatched` or `running`.
pub async fn list_in_flight(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status IN ('dispatched', 'running') \
         ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list in-flight tasks")?;

    Ok(tasks)
}

/// Ids of every task not yet in a terminal state.
pub async fn non_terminal_ids(pool: &PgPool) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM tasks WHERE status IN ('queued', 'dispatched', 'running')",
    )
    .fetch_all(pool)
    .await
    .context("failed to list non-terminal task ids")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Non-terminal drift-check tasks, used to rebuild drift guards.
pub async fn non_terminal_drift_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE is_drift_check AND status IN ('queued', 'dispatched', 'running')",
    )
    .fetch_all(pool)
    .await
    .context("failed to list drift tasks")?;

    Ok(tasks)
}

/// Whether a workspace has any task not yet in a terminal state.
pub async fn workspace_has_active_task(pool: &PgPool, workspace_id: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS( \
             SELECT 1 FROM tasks \
             WHERE workspace_id = $1 AND status IN ('queued', 'dispatched', 'running'))",
    )
    .bind(workspace_id)
    .fetch_one(pool)
    .await
    .context("failed to check workspace tasks")?;

    Ok(exists)
}

// -----------------------------------------------------------------------
// State-machine queries
// -----------------------------------------------------------------------

/// `queued -> dispatched`, recording the assigned agent.
pub async fn mark_dispatched(pool: &PgPool, id: i64, agent_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'dispatched', assigned_agent = $2, dispatched_at = NOW() \
         WHERE id = $1 AND status = 'queued'",
    )
    .bind(id)
    .bind(agent_id)
    .execute(pool)
    .await
    .context("failed to mark task dispatched")?;

    Ok(result.rows_affected())
}

/// `dispatched -> running`, only while still assigned to `agent_id`.
pub async fn mark_running(pool: &PgPool, id: i64, agent_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', started_at = NOW() \
         WHERE id = $1 AND status = 'dispatched' AND assigned_agent = $2",
    )
    .bind(id)
    .bind(agent_id)
    .execute(pool)
    .await
    .context("failed to mark task running")?;

    Ok(result.rows_affected())
}

/// Move a task from `from` into a terminal status, setting `completed_at`
/// and the optional error message.
pub async fn finish_task(
    pool: &PgPool,
    id: i64,
    from: TaskStatus,
    to: TaskStatus,
    error_message: Option<&str>,
    completed_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, error_message = $2, completed_at = $3 \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(error_message)
    .bind(completed_at)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to finish task")?;

    Ok(result.rows_affected())
}

/// Return an in-flight task to `queued`, clearing its assignment.
///
/// `count_retry` increments `retry_count`; it is set for agent-caused
/// re-queues and left unset for leader recovery.
pub async fn requeue_task(pool: &PgPool, id: i64, from: TaskStatus, count_retry: bool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'queued', \
             assigned_agent = NULL, \
             dispatched_at = NULL, \
             started_at = NULL, \
             retry_count = retry_count + CASE WHEN $3 THEN 1 ELSE 0 END \
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(from)
    .bind(count_retry)
    .execute(pool)
    .await
    .context("failed to requeue task")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Aggregates
// -----------------------------------------------------------------------

/// Task counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TaskCounts {
    pub queued: i64,
    pub dispatched: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub canceled: i64,
}

/// Count tasks by status across all pools.
pub async fn task_counts(pool: &PgPool) -> Result<TaskCounts> {
    let rows: Vec<(TaskStatus, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to count tasks")?;

    let mut counts = TaskCounts::default();
    for (status, n) in rows {
        match status {
            TaskStatus::Queued => counts.queued = n,
            TaskStatus::Dispatched => counts.dispatched = n,
            TaskStatus::Running => counts.running = n,
            TaskStatus::Succeeded => counts.succeeded = n,
            TaskStatus::Failed => counts.failed = n,
            TaskStatus::Canceled => counts.canceled = n,
        }
    }
    Ok(counts)
}
