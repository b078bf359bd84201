//! Leader recovery: reconcile in-flight rows with the sessions this process
//! holds before scheduling starts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{info, warn};

use corral_db::models::Task;
use corral_db::queries::tasks as task_db;

use crate::TaskId;
use crate::dispatcher::Dispatcher;
use crate::drift::DriftGuards;
use crate::queue::TaskQueue;
use crate::session::{AgentSession, SessionManager, is_stale};
use crate::state::dispatch as transitions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Already tracked by a local dispatcher.
    Keep,
    /// Hand to a dispatcher on the agent's live session.
    Adopt { verify: bool },
    Requeue,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub requeued: Vec<TaskId>,
    pub adopted: Vec<TaskId>,
    pub kept: Vec<TaskId>,
    pub tracked: usize,
    pub drift_guards: usize,
}

/// Decide what to do with one in-flight task.
pub fn plan(
    task: &Task,
    session: Option<&AgentSession>,
    already_tracked: bool,
    now: Instant,
    stale_after: Duration,
) -> RecoveryAction {
    if already_tracked {
        return RecoveryAction::Keep;
    }
    let Some(session) = session else {
        return RecoveryAction::Requeue;
    };
    if task.assigned_agent.as_deref() != Some(session.agent_id()) {
        return RecoveryAction::Requeue;
    }
    if let Some(last) = session.last_heartbeat() {
        if is_stale(last, now, stale_after) {
            return RecoveryAction::Requeue;
        }
    }
    match session.reports_task(task.id) {
        Some(true) => RecoveryAction::Adopt { verify: false },
        Some(false) => RecoveryAction::Requeue,
        None => RecoveryAction::Adopt { verify: true },
    }
}

/// Requeue orphaned in-flight tasks, adopt those still running on a local
/// session, then rebuild the queue's tracking set and the drift guards.
pub async fn recover(
    pool: &PgPool,
    sessions: &SessionManager,
    dispatcher: &Arc<Dispatcher>,
    queue: &TaskQueue,
    guards: &DriftGuards,
    stale_after: Duration,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let now = Instant::now();

    for task in task_db::list_in_flight(pool).await? {
        let session = task.assigned_agent.as_deref().and_then(|a| sessions.get(a));
        let action = plan(
            &task,
            session.as_deref(),
            dispatcher.is_in_flight(task.id),
            now,
            stale_after,
        );
        match (action, session) {
            (RecoveryAction::Keep, _) => report.kept.push(task.id),
            (RecoveryAction::Adopt { verify }, Some(session)) => {
                report.adopted.push(task.id);
                dispatcher.adopt(task, session, verify);
            }
            _ => {
                if transitions::requeue_for_recovery(pool, task.id, task.status).await? {
                    info!(
                        task_id = task.id,
                        agent_id = task.assigned_agent.as_deref().unwrap_or("-"),
                        from = %task.status,
                        "orphaned task requeued"
                    );
                    report.requeued.push(task.id);
                } else {
                    warn!(task_id = task.id, "task changed state during recovery");
                }
            }
        }
    }

    report.tracked = queue.rebuild().await?;
    let drift_tasks = task_db::non_terminal_drift_tasks(pool).await?;
    guards.rebuild(&drift_tasks);
    report.drift_guards = guards.len();

    info!(
        requeued = report.requeued.len(),
        adopted = report.adopted.len(),
        kept = report.kept.len(),
        tracked = report.tracked,
        drift_guards = report.drift_guards,
        "recovery complete"
    );
    Ok(report)
}
