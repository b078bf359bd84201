//! Task state machine transitions.
//!
//! Every transition names the status it expects to leave and is applied
//! with optimistic locking, so two writers racing on one task cannot both
//! win. Transitions report whether they applied; callers decide whether a
//! lost race is an error.

pub mod dispatch;

use anyhow::{Result, bail};
use chrono::Utc;
use sqlx::PgPool;

use corral_db::models::TaskStatus;
use corral_db::queries::tasks as db;

use crate::TaskId;

/// The task state machine.
///
/// ```text
/// queued     -> dispatched
/// queued     -> canceled
/// dispatched -> running
/// dispatched -> succeeded | failed | canceled
/// running    -> succeeded | failed | canceled
/// dispatched -> queued     (requeue)
/// running    -> queued     (requeue)
/// ```
///
/// Terminal states are absorbing.
pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Queued, Dispatched)
                | (Queued, Canceled)
                | (Dispatched, Running)
                | (Dispatched | Running, Succeeded | Failed | Canceled)
                | (Dispatched | Running, Queued)
        )
    }

    /// `queued -> dispatched`, assigning the agent.
    pub async fn dispatch(pool: &PgPool, task_id: TaskId, agent_id: &str) -> Result<bool> {
        Ok(db::mark_dispatched(pool, task_id, agent_id).await? == 1)
    }

    /// `dispatched -> running`, only while still assigned to `agent_id`.
    pub async fn start(pool: &PgPool, task_id: TaskId, agent_id: &str) -> Result<bool> {
        Ok(db::mark_running(pool, task_id, agent_id).await? == 1)
    }

    /// Move a task into a terminal status.
    pub async fn finish(
        pool: &PgPool,
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        if !to.is_terminal() || !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for task {task_id}");
        }
        let rows = db::finish_task(pool, task_id, from, to, error, Utc::now()).await?;
        Ok(rows == 1)
    }

    /// Return an in-flight task to `queued`, clearing its assignment.
    pub async fn requeue(
        pool: &PgPool,
        task_id: TaskId,
        from: TaskStatus,
        count_retry: bool,
    ) -> Result<bool> {
        if !Self::is_valid_transition(from, TaskStatus::Queued) {
            bail!("invalid state transition: {from} -> queued for task {task_id}");
        }
        Ok(db::requeue_task(pool, task_id, from, count_retry).await? == 1)
    }

    /// Finish a task that is either `dispatched` or `running`. Returns the
    /// status it left, or `None` if it was in neither (already terminal,
    /// requeued, or unknown).
    pub async fn finish_in_flight(
        pool: &PgPool,
        task_id: TaskId,
        to: TaskStatus,
        error: Option<&str>,
    ) -> Result<Option<TaskStatus>> {
        for from in [TaskStatus::Running, TaskStatus::Dispatched] {
            if Self::finish(pool, task_id, from, to, error).await? {
                return Ok(Some(from));
            }
        }
        Ok(None)
    }

    /// Requeue a task that is either `dispatched` or `running`.
    pub async fn requeue_in_flight(pool: &PgPool, task_id: TaskId, count_retry: bool) -> Result<bool> {
        for from in [TaskStatus::Running, TaskStatus::Dispatched] {
            if Self::requeue(pool, task_id, from, count_retry).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
