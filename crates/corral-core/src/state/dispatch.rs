//! Semantic wrappers over [`super::TaskStateMachine`] used by the
//! dispatcher, recovery and cancellation. Each returns whether the
//! transition applied.

use anyhow::Result;
use sqlx::PgPool;

use corral_db::models::TaskStatus;

use super::TaskStateMachine;
use crate::TaskId;

/// The agent started producing output: `dispatched -> running`.
pub async fn start_task(pool: &PgPool, task_id: TaskId, agent_id: &str) -> Result<bool> {
    TaskStateMachine::start(pool, task_id, agent_id).await
}

pub async fn succeed_task(pool: &PgPool, task_id: TaskId) -> Result<bool> {
    Ok(TaskStateMachine::finish_in_flight(pool, task_id, TaskStatus::Succeeded, None)
        .await?
        .is_some())
}

pub async fn fail_task(pool: &PgPool, task_id: TaskId, error: &str) -> Result<bool> {
    Ok(TaskStateMachine::finish_in_flight(pool, task_id, TaskStatus::Failed, Some(error))
        .await?
        .is_some())
}

/// Cancel a task nobody has picked up yet: `queued -> canceled`.
pub async fn cancel_queued_task(pool: &PgPool, task_id: TaskId) -> Result<bool> {
    TaskStateMachine::finish(pool, task_id, TaskStatus::Queued, TaskStatus::Canceled, None).await
}

/// Cancel an in-flight task whose agent can no longer report back.
pub async fn cancel_in_flight_task(pool: &PgPool, task_id: TaskId, reason: &str) -> Result<bool> {
    Ok(
        TaskStateMachine::finish_in_flight(pool, task_id, TaskStatus::Canceled, Some(reason))
            .await?
            .is_some(),
    )
}

/// Requeue an orphan found by leader recovery; does not count as a retry.
pub async fn requeue_for_recovery(pool: &PgPool, task_id: TaskId, from: TaskStatus) -> Result<bool> {
    TaskStateMachine::requeue(pool, task_id, from, false).await
}
