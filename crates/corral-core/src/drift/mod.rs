//! Drift scheduler: periodic `plan` runs that detect divergence between
//! declared and observed infrastructure.
//!
//! Each workspace carries its own interval, optional UTC time window and
//! continue-on-success/failure flags. A per-workspace guard keeps at most
//! one drift check in flight.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use corral_db::models::{DriftStatus, Task, TaskStatus, TaskType, Workspace};
use corral_db::queries::{agents as agent_db, tasks as task_db, workspaces as workspace_db};

use crate::TaskId;
use crate::queue::TaskQueue;

/// Why a workspace was not checked on this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    OutsideWindow,
    NotDue,
    LastFailed,
    LastSucceeded,
    NoPool,
    ActiveTask,
    NoOnlineAgent,
    GuardHeld,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disabled => "drift checks disabled",
            Self::OutsideWindow => "outside drift window",
            Self::NotDue => "interval not elapsed",
            Self::LastFailed => "last check failed and continue_on_failure is off",
            Self::LastSucceeded => "last check succeeded and continue_on_success is off",
            Self::NoPool => "workspace has no pool",
            Self::ActiveTask => "workspace has an active task",
            Self::NoOnlineAgent => "no online agent in pool",
            Self::GuardHeld => "drift check already in flight",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub enum DriftOutcome {
    Started(Task),
    Skipped(SkipReason),
}

/// Whether `now` falls inside `[start, end]`. A window whose end is before
/// its start wraps midnight. Without both bounds every time is inside.
pub fn in_window(start: Option<NaiveTime>, end: Option<NaiveTime>, now: NaiveTime) -> bool {
    match (start, end) {
        (Some(start), Some(end)) if start <= end => start <= now && now <= end,
        (Some(start), Some(end)) => now >= start || now <= end,
        _ => true,
    }
}

/// Never-run workspaces are always due.
pub fn is_due(last: Option<DateTime<Utc>>, interval_minutes: i32, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => now - last >= chrono::Duration::minutes(i64::from(interval_minutes)),
    }
}

/// The schedule-level checks: enabled flag, window, interval and the
/// continue flags.
pub fn evaluate_schedule(ws: &Workspace, now: DateTime<Utc>) -> Result<(), SkipReason> {
    if !ws.drift_enabled {
        return Err(SkipReason::Disabled);
    }
    if !in_window(ws.drift_window_start, ws.drift_window_end, now.time()) {
        return Err(SkipReason::OutsideWindow);
    }
    if !is_due(ws.last_drift_at, ws.drift_interval_minutes, now) {
        return Err(SkipReason::NotDue);
    }
    match ws.drift_status {
        Some(DriftStatus::Failed) if !ws.continue_on_failure => Err(SkipReason::LastFailed),
        Some(DriftStatus::Succeeded) if !ws.continue_on_success => Err(SkipReason::LastSucceeded),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// One in-flight drift check per workspace.
#[derive(Default)]
pub struct DriftGuards {
    held: Mutex<HashMap<String, Option<TaskId>>>,
}

impl DriftGuards {
    pub fn try_acquire(&self, workspace_id: &str) -> bool {
        let mut held = self.held.lock();
        if held.contains_key(workspace_id) {
            return false;
        }
        held.insert(workspace_id.to_string(), None);
        true
    }

    pub fn attach(&self, workspace_id: &str, task_id: TaskId) {
        self.held.lock().insert(workspace_id.to_string(), Some(task_id));
    }

    pub fn release(&self, workspace_id: &str) -> bool {
        self.held.lock().remove(workspace_id).is_some()
    }

    pub fn is_held(&self, workspace_id: &str) -> bool {
        self.held.lock().contains_key(workspace_id)
    }

    pub fn held_task(&self, workspace_id: &str) -> Option<TaskId> {
        self.held.lock().get(workspace_id).copied().flatten()
    }

    /// Replace all guards with those implied by non-terminal drift tasks.
    pub fn rebuild(&self, tasks: &[Task]) {
        let mut held = self.held.lock();
        held.clear();
        for task in tasks.iter().filter(|t| t.is_drift_check) {
            held.insert(task.workspace_id.clone(), Some(task.id));
        }
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }

    /// Record a drift task's terminal status and completion time on its
    /// workspace and release the guard.
    pub async fn finish(&self, pool: &PgPool, task: &Task, status: TaskStatus) -> Result<()> {
        if !task.is_drift_check {
            return Ok(());
        }
        let drift_status = if status == TaskStatus::Succeeded {
            DriftStatus::Succeeded
        } else {
            DriftStatus::Failed
        };
        self.release(&task.workspace_id);
        let completed_at = task_db::get_task(pool, task.id)
            .await?
            .and_then(|t| t.completed_at)
            .unwrap_or_else(Utc::now);
        workspace_db::set_drift_status(pool, &task.workspace_id, drift_status, Some(completed_at))
            .await
            .with_context(|| format!("failed to record drift result for {}", task.workspace_id))?;
        info!(
            workspace_id = %task.workspace_id,
            task_id = task.id,
            drift_status = %drift_status,
            "drift check finished"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct DriftScheduler {
    pool: PgPool,
    queue: Arc<TaskQueue>,
    guards: Arc<DriftGuards>,
    tick: Duration,
}

impl DriftScheduler {
    pub fn new(pool: PgPool, queue: Arc<TaskQueue>, guards: Arc<DriftGuards>, tick: Duration) -> Self {
        Self {
            pool,
            queue,
            guards,
            tick,
        }
    }

    pub fn guards(&self) -> &Arc<DriftGuards> {
        &self.guards
    }

    /// Tick until cancelled. The first check happens one tick after start.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.tick;
        let mut ticker = tokio::time::interval_at(start, self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(tick = ?self.tick, "drift scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "drift tick failed");
                    }
                }
            }
        }
        info!("drift scheduler stopped");
    }

    /// Check every drift-enabled workspace once. Returns the tasks started.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let workspaces = workspace_db::list_drift_enabled(&self.pool).await?;
        let mut started = Vec::new();
        for ws in workspaces {
            if let Err(reason) = evaluate_schedule(&ws, now) {
                debug!(workspace_id = %ws.workspace_id, reason = %reason, "drift check skipped");
                continue;
            }
            match self.start(&ws).await {
                Ok(DriftOutcome::Started(task)) => started.push(task),
                Ok(DriftOutcome::Skipped(reason)) => {
                    debug!(workspace_id = %ws.workspace_id, reason = %reason, "drift check skipped");
                }
                Err(e) => {
                    warn!(workspace_id = %ws.workspace_id, error = %e, "failed to start drift check");
                }
            }
        }
        Ok(started)
    }

    /// Start a drift check now, ignoring interval, window and continue flags.
    pub async fn trigger_now(&self, workspace_id: &str) -> Result<DriftOutcome> {
        let ws = workspace_db::get_workspace(&self.pool, workspace_id)
            .await?
            .with_context(|| format!("workspace {workspace_id} not found"))?;
        self.start(&ws).await
    }

    async fn start(&self, ws: &Workspace) -> Result<DriftOutcome> {
        let Some(pool_id) = ws.pool_id.as_deref() else {
            return Ok(DriftOutcome::Skipped(SkipReason::NoPool));
        };
        if self.guards.is_held(&ws.workspace_id) {
            return Ok(DriftOutcome::Skipped(SkipReason::GuardHeld));
        }
        if task_db::workspace_has_active_task(&self.pool, &ws.workspace_id).await? {
            return Ok(DriftOutcome::Skipped(SkipReason::ActiveTask));
        }
        if agent_db::count_online_in_pool(&self.pool, pool_id).await? == 0 {
            return Ok(DriftOutcome::Skipped(SkipReason::NoOnlineAgent));
        }
        if !self.guards.try_acquire(&ws.workspace_id) {
            return Ok(DriftOutcome::Skipped(SkipReason::GuardHeld));
        }

        let task = match self.queue.submit(&ws.workspace_id, TaskType::Plan, true).await {
            Ok(task) => task,
            Err(e) => {
                self.guards.release(&ws.workspace_id);
                return Err(e);
            }
        };
        self.guards.attach(&ws.workspace_id, task.id);
        if let Err(e) =
            workspace_db::set_drift_status(&self.pool, &ws.workspace_id, DriftStatus::Running, None).await
        {
            warn!(workspace_id = %ws.workspace_id, error = %e, "failed to mark drift running");
        }
        info!(workspace_id = %ws.workspace_id, task_id = task.id, "drift check enqueued");
        Ok(DriftOutcome::Started(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn workspace() -> Workspace {
        Workspace {
            workspace_id: "ws".to_string(),
            name: "ws".to_string(),
            pool_id: Some("p1".to_string()),
            drift_enabled: true,
            drift_interval_minutes: 60,
            drift_window_start: None,
            drift_window_end: None,
            continue_on_success: true,
            continue_on_failure: true,
            last_drift_at: None,
            drift_status: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn window_bounds_are_inclusive() {
        assert!(in_window(Some(t(9, 0)), Some(t(17, 0)), t(9, 0)));
        assert!(in_window(Some(t(9, 0)), Some(t(17, 0)), t(17, 0)));
        assert!(!in_window(Some(t(9, 0)), Some(t(17, 0)), t(17, 1)));
        assert!(!in_window(Some(t(9, 0)), Some(t(17, 0)), t(8, 59)));
    }

    #[test]
    fn window_may_wrap_midnight() {
        assert!(in_window(Some(t(22, 0)), Some(t(4, 0)), t(23, 30)));
        assert!(in_window(Some(t(22, 0)), Some(t(4, 0)), t(3, 0)));
        assert!(!in_window(Some(t(22, 0)), Some(t(4, 0)), t(12, 0)));
    }

    #[test]
    fn partial_window_is_ignored() {
        assert!(in_window(Some(t(9, 0)), None, t(1, 0)));
        assert!(in_window(None, None, t(1, 0)));
    }

    #[test]
    fn due_after_interval() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert!(is_due(None, 60, now));
        assert!(is_due(Some(now - chrono::Duration::minutes(60)), 60, now));
        assert!(!is_due(Some(now - chrono::Duration::minutes(59)), 60, now));
    }

    #[test]
    fn continue_flags_gate_follow_up_checks() {
        let now = Utc::now();
        let mut ws = workspace();
        ws.last_drift_at = Some(now - chrono::Duration::hours(2));
        ws.drift_status = Some(DriftStatus::Failed);
        assert_eq!(evaluate_schedule(&ws, now), Ok(()));
        ws.continue_on_failure = false;
        assert_eq!(evaluate_schedule(&ws, now), Err(SkipReason::LastFailed));

        ws.drift_status = Some(DriftStatus::Succeeded);
        assert_eq!(evaluate_schedule(&ws, now), Ok(()));
        ws.continue_on_success = false;
        assert_eq!(evaluate_schedule(&ws, now), Err(SkipReason::LastSucceeded));
    }

    #[test]
    fn disabled_workspace_is_skipped() {
        let mut ws = workspace();
        ws.drift_enabled = false;
        assert_eq!(evaluate_schedule(&ws, Utc::now()), Err(SkipReason::Disabled));
    }

    #[test]
    fn guards_are_exclusive_per_workspace() {
        let guards = DriftGuards::default();
        assert!(guards.try_acquire("a"));
        assert!(!guards.try_acquire("a"));
        assert!(guards.try_acquire("b"));
        guards.attach("a", 5);
        assert_eq!(guards.held_task("a"), Some(5));
        assert!(guards.release("a"));
        assert!(!guards.release("a"));
        assert!(guards.try_acquire("a"));
    }
}
