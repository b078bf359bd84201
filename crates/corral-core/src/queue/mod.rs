//! Task queue: a durable FIFO per pool with an in-memory view of what is
//! not yet terminal and what is currently claimed.
//!
//! The durable order lives in the `tasks` table (`status = queued`, by id
//! within a pool). This process additionally tracks:
//! - the non-terminal set, which makes `enqueue` idempotent;
//! - claims, which hide a task from `peek` between the scheduler choosing
//!   it and the dispatcher confirming it, and expire after the claim lease;
//! - one wake-up handle per pool for the scheduler.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_db::models::{Task, TaskType};
use corral_db::queries::{tasks as task_db, workspaces as workspace_db};

use crate::TaskId;
use crate::error::CoordinatorError;
use crate::state::TaskStateMachine;

struct Claim {
    pool_id: String,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    non_terminal: HashSet<TaskId>,
    claims: HashMap<TaskId, Claim>,
    wakers: HashMap<String, Arc<Notify>>,
}

impl QueueState {
    fn waker(&mut self, pool_id: &str) -> Arc<Notify> {
        Arc::clone(
            self.wakers
                .entry(pool_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }
}

pub struct TaskQueue {
    pool: PgPool,
    claim_lease: Duration,
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new(pool: PgPool, claim_lease: Duration) -> Self {
        Self {
            pool,
            claim_lease,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Create a task for a workspace in the workspace's pool and enqueue it.
    pub async fn submit(&self, workspace_id: &str, task_type: TaskType, is_drift_check: bool) -> Result<Task> {
        let workspace = workspace_db::get_workspace(&self.pool, workspace_id)
            .await?
            .with_context(|| format!("workspace {workspace_id} not found"))?;
        let Some(pool_id) = workspace.pool_id.as_deref() else {
            bail!("workspace {workspace_id} is not bound to a pool");
        };

        let task = task_db::insert_task(&self.pool, workspace_id, pool_id, task_type, is_drift_check).await?;
        info!(
            task_id = task.id,
            workspace_id,
            pool_id,
            task_type = %task_type,
            "task submitted"
        );
        self.enqueue(&task);
        Ok(task)
    }

    /// Track a queued task and wake its pool's scheduler. A no-op for a task
    /// already tracked as queued, dispatched or running.
    pub fn enqueue(&self, task: &Task) -> bool {
        let waker = {
            let mut state = self.state.lock();
            if !state.non_terminal.insert(task.id) {
                return false;
            }
            state.waker(&task.pool_id)
        };
        waker.notify_one();
        true
    }

    /// The oldest queued, unclaimed task of a pool.
    pub async fn peek(&self, pool_id: &str) -> Result<Option<Task>> {
        let claimed = {
            let state = self.state.lock();
            state.claims.values().filter(|c| c.pool_id == pool_id).count()
        };
        let limit = i64::try_from(claimed + 1).unwrap_or(i64::MAX);
        let candidates = task_db::queued_for_pool(&self.pool, pool_id, limit).await?;

        let mut state = self.state.lock();
        for task in &candidates {
            // Rows written by other processes join the set here.
            state.non_terminal.insert(task.id);
        }
        Ok(candidates
            .into_iter()
            .find(|t| !state.claims.contains_key(&t.id)))
    }

    /// Claim the oldest queued, unclaimed task of a pool for the claim lease.
    pub async fn claim(&self, pool_id: &str) -> Result<Option<Task>> {
        let Some(task) = self.peek(pool_id).await? else {
            return Ok(None);
        };
        let mut state = self.state.lock();
        if state.claims.contains_key(&task.id) {
            return Ok(None);
        }
        state.claims.insert(
            task.id,
            Claim {
                pool_id: pool_id.to_string(),
                deadline: Instant::now() + self.claim_lease,
            },
        );
        debug!(task_id = task.id, pool_id, "task claimed");
        Ok(Some(task))
    }

    /// Confirm a claim by moving the task to `dispatched` on `agent_id`.
    /// Returns `false` when the row was no longer queued (e.g. canceled).
    pub async fn confirm(&self, task_id: TaskId, agent_id: &str) -> Result<bool> {
        let applied = TaskStateMachine::dispatch(&self.pool, task_id, agent_id).await;
        self.state.lock().claims.remove(&task_id);
        applied
    }

    /// Give a claim back without dispatching.
    pub fn release(&self, task_id: TaskId) -> bool {
        let waker = {
            let mut state = self.state.lock();
            let Some(claim) = state.claims.remove(&task_id) else {
                return false;
            };
            state.waker(&claim.pool_id)
        };
        waker.notify_one();
        true
    }

    /// Drop claims whose lease ran out, making their tasks peekable again.
    pub fn sweep_expired_claims(&self, now: Instant) -> Vec<TaskId> {
        let (expired, wakers) = {
            let mut state = self.state.lock();
            let expired: Vec<(TaskId, String)> = state
                .claims
                .iter()
                .filter(|(_, c)| c.deadline <= now)
                .map(|(id, c)| (*id, c.pool_id.clone()))
                .collect();
            let mut wakers = Vec::with_capacity(expired.len());
            for (id, pool_id) in &expired {
                state.claims.remove(id);
                wakers.push(state.waker(pool_id));
            }
            (expired, wakers)
        };
        for (task_id, _) in &expired {
            let err = CoordinatorError::QueueClaimTimeout { task_id: *task_id };
            warn!(task_id = *task_id, error = %err, "returning task to queue");
        }
        for waker in wakers {
            waker.notify_one();
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    /// Requeue an in-flight task and wake its pool.
    pub async fn requeue(&self, task: &Task, count_retry: bool) -> Result<bool> {
        let applied = TaskStateMachine::requeue_in_flight(&self.pool, task.id, count_retry).await?;
        if applied {
            let waker = {
                let mut state = self.state.lock();
                state.non_terminal.insert(task.id);
                state.waker(&task.pool_id)
            };
            waker.notify_one();
        }
        Ok(applied)
    }

    /// Forget a task that reached a terminal state.
    pub fn mark_terminal(&self, task_id: TaskId) {
        let mut state = self.state.lock();
        state.non_terminal.remove(&task_id);
        state.claims.remove(&task_id);
    }

    /// Reload the non-terminal set from the store. Returns its size.
    pub async fn rebuild(&self) -> Result<usize> {
        let ids = task_db::non_terminal_ids(&self.pool).await?;
        let mut state = self.state.lock();
        state.non_terminal = ids.into_iter().collect();
        state.claims.clear();
        Ok(state.non_terminal.len())
    }

    pub fn is_tracked(&self, task_id: TaskId) -> bool {
        self.state.lock().non_terminal.contains(&task_id)
    }

    pub fn is_claimed(&self, task_id: TaskId) -> bool {
        self.state.lock().claims.contains_key(&task_id)
    }

    pub fn tracked_len(&self) -> usize {
        self.state.lock().non_terminal.len()
    }

    /// The wake-up handle of a pool's scheduler loop.
    pub fn waker(&self, pool_id: &str) -> Arc<Notify> {
        self.state.lock().waker(pool_id)
    }

    pub fn notify(&self, pool_id: &str) {
        self.waker(pool_id).notify_one();
    }

    pub async fn run_claim_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_expired_claims(Instant::now());
                }
            }
        }
    }
}
