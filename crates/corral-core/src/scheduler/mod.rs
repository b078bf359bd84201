//! Scheduler: one cooperative loop per pool matching the head of the pool's
//! queue to an agent session with spare capacity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use corral_db::models::TaskType;
use corral_db::queries::{pools as pool_db, tasks as task_db};

use crate::dispatcher::Dispatcher;
use crate::queue::TaskQueue;
use crate::session::{AgentSession, SessionManager};

/// Pick the session to receive a task of `task_type`.
///
/// Only sessions that have sent a heartbeat are considered. Among those that
/// can accept the task, fewest reservations wins, then the newest heartbeat.
pub fn select_session(sessions: &[Arc<AgentSession>], task_type: TaskType) -> Option<Arc<AgentSession>> {
    sessions
        .iter()
        .filter(|s| !s.is_closed() && s.has_heartbeat() && s.can_accept(task_type))
        .min_by(|a, b| {
            a.reservation_count()
                .cmp(&b.reservation_count())
                .then_with(|| b.last_heartbeat().cmp(&a.last_heartbeat()))
        })
        .cloned()
}

pub struct Scheduler {
    pool: PgPool,
    queue: Arc<TaskQueue>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        queue: Arc<TaskQueue>,
        sessions: Arc<SessionManager>,
        dispatcher: Arc<Dispatcher>,
        tick: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            sessions,
            dispatcher,
            interval: tick,
        }
    }

    /// Supervise per-pool loops until `cancel` fires. The pool list is
    /// refreshed every tick; a loop is started for each pool not yet running.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut loops = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut ticker = tokio::time::interval(self.interval);
        info!(tick = ?self.interval, "scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                Some(joined) = loops.join_next_with_id(), if !loops.is_empty() => {
                    let id = match joined {
                        Ok((id, ())) => id,
                        Err(e) => {
                            error!(error = %e, "pool loop panicked");
                            e.id()
                        }
                    };
                    running.remove(&id);
                    continue;
                }
            }

            let pool_ids = match self.pool_ids().await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "failed to refresh pool list");
                    continue;
                }
            };
            let live: HashSet<&String> = running.values().collect();
            let new_pools: Vec<String> = pool_ids.into_iter().filter(|id| !live.contains(id)).collect();
            for pool_id in new_pools {
                let this = Arc::clone(&self);
                let token = cancel.child_token();
                let name = pool_id.clone();
                let handle = loops.spawn(async move { this.run_pool(name, token).await });
                running.insert(handle.id(), pool_id);
            }
        }

        loops.shutdown().await;
        info!("scheduler stopped");
    }

    async fn pool_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = pool_db::list_pools(&self.pool)
            .await?
            .into_iter()
            .map(|p| p.pool_id)
            .collect();
        for id in task_db::pools_with_queued(&self.pool).await? {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn run_pool(&self, pool_id: String, cancel: CancellationToken) {
        let waker = self.queue.waker(&pool_id);
        let mut ticker = tokio::time::interval(self.interval);
        debug!(pool_id = %pool_id, "pool loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = waker.notified() => {}
            }
            match self.tick(&pool_id).await {
                Ok(0) => {}
                Ok(n) => debug!(pool_id = %pool_id, dispatched = n, "scheduler tick"),
                Err(e) => warn!(pool_id = %pool_id, error = %e, "scheduler tick failed"),
            }
        }
        debug!(pool_id = %pool_id, "pool loop stopped");
    }

    /// Dispatch queued tasks of one pool, in order, until the head cannot
    /// be placed. Returns the number dispatched.
    pub async fn tick(&self, pool_id: &str) -> Result<usize> {
        let mut dispatched = 0;
        loop {
            let Some(head) = self.queue.peek(pool_id).await? else {
                break;
            };
            let candidates = self.sessions.for_pool(pool_id);
            let Some(session) = select_session(&candidates, head.task_type) else {
                debug!(
                    pool_id,
                    task_id = head.id,
                    sessions = candidates.len(),
                    "no session with capacity, task stays queued"
                );
                break;
            };

            let Some(task) = self.queue.claim(pool_id).await? else {
                break;
            };
            if task.id != head.id {
                // The head moved between peek and claim.
                self.queue.release(task.id);
                continue;
            }
            if !session.try_reserve(task.id, task.task_type) {
                self.queue.release(task.id);
                break;
            }

            debug!(task_id = task.id, agent_id = %session.agent_id(), "task matched");
            self.dispatcher.dispatch(task, session);
            dispatched += 1;
        }
        Ok(dispatched)
    }
}
