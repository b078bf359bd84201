//! Dispatcher: drives one (task, agent) pair from `run_task` to a terminal
//! state.
//!
//! Every in-flight task has an entry in the in-flight map holding its
//! agent, a signal channel fed by the session read loops, and a one-shot
//! cancel handle. The entry is registered before `run_task` is queued so a
//! fast terminal frame always finds it. Each dispatch runs in its own tokio
//! task and never blocks the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use corral_db::models::{Task, TaskStatus};
use corral_db::queries::tasks as task_db;

use crate::TaskId;
use crate::config::CoordinatorConfig;
use crate::drift::DriftGuards;
use crate::error::CoordinatorError;
use crate::hub::OutputHub;
use crate::protocol::{CoordinatorFrame, LineKind, OutputLine, RunTask};
use crate::queue::TaskQueue;
use crate::session::{AgentSession, SessionManager};
use crate::state::dispatch as transitions;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub ack_timeout: Duration,
    pub max_task_duration: Duration,
    pub cancel_grace: Duration,
    pub retry_limit: i32,
}

impl From<&CoordinatorConfig> for DispatcherConfig {
    fn from(c: &CoordinatorConfig) -> Self {
        Self {
            ack_timeout: c.dispatch_ack_timeout,
            max_task_duration: c.max_task_duration,
            cancel_grace: c.cancel_grace,
            retry_limit: c.retry_limit,
        }
    }
}

#[derive(Debug)]
enum Signal {
    Completed,
    Failed(String),
    Started,
    Heartbeat { reported: bool },
    SessionClosed { replaced: bool },
}

struct InFlight {
    generation: u64,
    agent_id: String,
    signals: mpsc::UnboundedSender<Signal>,
    cancel: CancellationToken,
}

/// How a wait for the terminal frame ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed(String),
    Unresponsive,
    Disconnected { cancel_requested: bool },
}

pub struct Dispatcher {
    pool: PgPool,
    queue: Arc<TaskQueue>,
    sessions: Arc<SessionManager>,
    hub: Arc<OutputHub>,
    guards: Arc<DriftGuards>,
    config: DispatcherConfig,
    inflight: Mutex<HashMap<TaskId, InFlight>>,
    next_generation: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        pool: PgPool,
        queue: Arc<TaskQueue>,
        sessions: Arc<SessionManager>,
        hub: Arc<OutputHub>,
        guards: Arc<DriftGuards>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            sessions,
            hub,
            guards,
            config,
            inflight: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Send a claimed task to `session`, whose slot is already reserved.
    pub fn dispatch(self: &Arc<Self>, task: Task, session: Arc<AgentSession>) {
        let (generation, rx, cancel) = self.register(task.id, session.agent_id());
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(mut rx) = this.deliver(&task, &session, generation, rx).await else {
                return;
            };
            let outcome = this.wait(&task, &session, &mut rx, &cancel, false, false).await;
            this.finalize(task, &session, generation, outcome).await;
        });
    }

    /// Take over a task already running on `session`, found by recovery.
    /// With `verify` set the task is requeued unless the next heartbeat
    /// lists it.
    pub fn adopt(self: &Arc<Self>, task: Task, session: Arc<AgentSession>, verify: bool) {
        let (generation, mut rx, cancel) = self.register(task.id, session.agent_id());
        self.hub.open(task.id);
        info!(task_id = task.id, agent_id = %session.agent_id(), verify, "adopted in-flight task");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let running = task.status == TaskStatus::Running;
            let outcome = this.wait(&task, &session, &mut rx, &cancel, verify, running).await;
            this.finalize(task, &session, generation, outcome).await;
        });
    }

    fn register(
        &self,
        task_id: TaskId,
        agent_id: &str,
    ) -> (u64, mpsc::UnboundedReceiver<Signal>, CancellationToken) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.inflight.lock().insert(
            task_id,
            InFlight {
                generation,
                agent_id: agent_id.to_string(),
                signals: tx,
                cancel: cancel.clone(),
            },
        );
        (generation, rx, cancel)
    }

    fn unregister(&self, task_id: TaskId, generation: u64) {
        let mut inflight = self.inflight.lock();
        if inflight.get(&task_id).is_some_and(|e| e.generation == generation) {
            inflight.remove(&task_id);
        }
    }

    /// Queue `run_task` and confirm the claim. On failure the task goes back
    /// to the queue and `None` is returned.
    async fn deliver(
        &self,
        task: &Task,
        session: &AgentSession,
        generation: u64,
        rx: mpsc::UnboundedReceiver<Signal>,
    ) -> Option<mpsc::UnboundedReceiver<Signal>> {
        let frame = CoordinatorFrame::RunTask(RunTask {
            task_id: task.id,
            workspace_id: task.workspace_id.clone(),
            action: task.action,
        });
        if let Err(e) = session.enqueue(frame).await {
            warn!(task_id = task.id, agent_id = %session.agent_id(), error = %e, "run_task not delivered, returning task to queue");
            self.abandon(task, session, generation);
            return None;
        }

        match self.queue.confirm(task.id, session.agent_id()).await {
            Ok(true) => {
                self.hub.open(task.id);
                info!(task_id = task.id, agent_id = %session.agent_id(), pool_id = %task.pool_id, "task dispatched");
                Some(rx)
            }
            Ok(false) => {
                warn!(task_id = task.id, "task left the queue before dispatch, cancelling on agent");
                self.withdraw(task, session).await;
                self.abandon(task, session, generation);
                None
            }
            Err(e) => {
                error!(task_id = task.id, error = %e, "failed to confirm dispatch, cancelling on agent");
                self.withdraw(task, session).await;
                self.abandon(task, session, generation);
                None
            }
        }
    }

    /// Take back a `run_task` that was queued for a task we no longer own.
    async fn withdraw(&self, task: &Task, session: &AgentSession) {
        if let Err(e) = session.enqueue(CoordinatorFrame::cancel(task.id)).await {
            warn!(task_id = task.id, agent_id = %session.agent_id(), error = %e, "cancel_task for withdrawn task not sent");
        }
    }

    fn abandon(&self, task: &Task, session: &AgentSession, generation: u64) {
        session.release_reservation(task.id);
        self.unregister(task.id, generation);
        self.queue.release(task.id);
    }

    async fn wait(
        &self,
        task: &Task,
        session: &AgentSession,
        rx: &mut mpsc::UnboundedReceiver<Signal>,
        cancel: &CancellationToken,
        mut verify: bool,
        mut running: bool,
    ) -> Outcome {
        let started = Instant::now();
        let ceiling = sleep_until(started + self.config.max_task_duration);
        let ack_deadline = sleep_until(started + self.config.ack_timeout);
        let grace = sleep(Duration::ZERO);
        tokio::pin!(ceiling, ack_deadline, grace);

        let mut cancel_sent = false;
        let mut cancel_requested = false;
        let mut ack_checked = false;

        loop {
            tokio::select! {
                signal = rx.recv() => match signal {
                    Some(Signal::Completed) => return Outcome::Succeeded,
                    Some(Signal::Failed(error)) => return Outcome::Failed(error),
                    Some(Signal::Started) => self.mark_running(task, session.agent_id(), &mut running).await,
                    Some(Signal::Heartbeat { reported: true }) => {
                        verify = false;
                        self.mark_running(task, session.agent_id(), &mut running).await;
                    }
                    Some(Signal::Heartbeat { reported: false }) => {
                        if verify {
                            info!(task_id = task.id, "agent no longer reports task");
                            return Outcome::Disconnected { cancel_requested };
                        }
                    }
                    Some(Signal::SessionClosed { replaced: true }) => {
                        debug!(task_id = task.id, "session replaced, verifying on next heartbeat");
                        verify = true;
                    }
                    Some(Signal::SessionClosed { replaced: false }) | None => {
                        return Outcome::Disconnected { cancel_requested };
                    }
                },
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_requested = true;
                    cancel_sent = true;
                    self.send_cancel(task, session).await;
                    grace.as_mut().reset(Instant::now() + self.config.cancel_grace);
                }
                _ = &mut ceiling, if !cancel_sent => {
                    warn!(task_id = task.id, limit = ?self.config.max_task_duration, "task exceeded its hard ceiling");
                    cancel_sent = true;
                    self.send_cancel(task, session).await;
                    grace.as_mut().reset(Instant::now() + self.config.cancel_grace);
                }
                _ = &mut grace, if cancel_sent => return Outcome::Unresponsive,
                _ = &mut ack_deadline, if !ack_checked => {
                    ack_checked = true;
                    if session.release_reservation(task.id) {
                        warn!(task_id = task.id, agent_id = %session.agent_id(), "dispatch not acknowledged, releasing reservation");
                    }
                }
            }
        }
    }

    async fn mark_running(&self, task: &Task, agent_id: &str, running: &mut bool) {
        if *running {
            return;
        }
        match transitions::start_task(&self.pool, task.id, agent_id).await {
            Ok(applied) => {
                *running = true;
                if applied {
                    info!(task_id = task.id, agent_id, "task running");
                }
            }
            Err(e) => warn!(task_id = task.id, error = %e, "failed to mark task running"),
        }
    }

    async fn send_cancel(&self, task: &Task, session: &AgentSession) {
        let current = self.sessions.get(session.agent_id());
        let target = current.as_deref().unwrap_or(session);
        match target.enqueue(CoordinatorFrame::cancel(task.id)).await {
            Ok(()) => info!(task_id = task.id, agent_id = %target.agent_id(), "cancel_task sent"),
            Err(e) => warn!(task_id = task.id, error = %e, "failed to send cancel_task"),
        }
    }

    async fn finalize(&self, task: Task, session: &AgentSession, generation: u64, outcome: Outcome) {
        session.release_reservation(task.id);
        let agent_id = session.agent_id().to_string();

        let result = match outcome {
            Outcome::Succeeded => transitions::succeed_task(&self.pool, task.id)
                .await
                .map(|applied| (applied, TaskStatus::Succeeded, OutputLine::synthetic(LineKind::Completed, "task completed"))),
            Outcome::Failed(error) => transitions::fail_task(&self.pool, task.id, &error)
                .await
                .map(|applied| (applied, TaskStatus::Failed, OutputLine::synthetic(LineKind::Error, error))),
            Outcome::Unresponsive => {
                let err = CoordinatorError::AgentUnresponsive {
                    agent_id: agent_id.clone(),
                    grace: self.config.cancel_grace,
                };
                let message = err.task_message();
                transitions::fail_task(&self.pool, task.id, &message)
                    .await
                    .map(|applied| (applied, TaskStatus::Failed, OutputLine::synthetic(LineKind::Error, message)))
            }
            Outcome::Disconnected { cancel_requested: true } => {
                let message = "canceled; agent disconnected before confirming";
                transitions::cancel_in_flight_task(&self.pool, task.id, message)
                    .await
                    .map(|applied| (applied, TaskStatus::Canceled, OutputLine::synthetic(LineKind::Canceled, message)))
            }
            Outcome::Disconnected { cancel_requested: false } if task.retry_count < self.config.retry_limit => {
                self.unregister(task.id, generation);
                self.hub.end_subscribers(task.id);
                match self.queue.requeue(&task, true).await {
                    Ok(true) => info!(
                        task_id = task.id,
                        agent_id = %agent_id,
                        retry = task.retry_count + 1,
                        "agent disconnected, task requeued"
                    ),
                    Ok(false) => debug!(task_id = task.id, "task already left its in-flight state"),
                    Err(e) => error!(task_id = task.id, error = %e, "failed to requeue task"),
                }
                return;
            }
            Outcome::Disconnected { cancel_requested: false } => {
                let err = CoordinatorError::AgentDisconnected {
                    agent_id: agent_id.clone(),
                };
                let message = err.task_message();
                warn!(task_id = task.id, retries = task.retry_count, "retry limit reached");
                transitions::fail_task(&self.pool, task.id, &message)
                    .await
                    .map(|applied| (applied, TaskStatus::Failed, OutputLine::synthetic(LineKind::Error, message)))
            }
        };

        self.unregister(task.id, generation);
        match result {
            Ok((applied, status, last_line)) => {
                if applied {
                    info!(task_id = task.id, agent_id = %agent_id, status = %status, "task finished");
                } else {
                    debug!(task_id = task.id, "task was already terminal");
                }
                self.settle(&task, status, last_line).await;
            }
            Err(e) => error!(task_id = task.id, error = %e, "failed to record task outcome"),
        }
    }

    /// Local bookkeeping once a task is terminal.
    async fn settle(&self, task: &Task, status: TaskStatus, last_line: OutputLine) {
        self.queue.mark_terminal(task.id);
        self.hub.finish(task.id, last_line);
        if let Err(e) = self.guards.finish(&self.pool, task, status).await {
            warn!(task_id = task.id, error = %e, "failed to record drift outcome");
        }
        self.queue.notify(&task.pool_id);
    }

    // -- routing from session read loops ------------------------------------

    fn signal(&self, agent_id: &str, task_id: TaskId, signal: Signal) -> bool {
        let inflight = self.inflight.lock();
        match inflight.get(&task_id) {
            Some(entry) if entry.agent_id == agent_id => entry.signals.send(signal).is_ok(),
            Some(entry) => {
                warn!(task_id, agent_id, assigned = %entry.agent_id, "frame from an agent the task is not assigned to");
                false
            }
            None => false,
        }
    }

    /// Route `task_completed`. Returns `false` when no dispatch is waiting.
    pub fn complete(&self, agent_id: &str, task_id: TaskId) -> bool {
        self.signal(agent_id, task_id, Signal::Completed)
    }

    /// Route `task_failed`. Returns `false` when no dispatch is waiting.
    pub fn fail(&self, agent_id: &str, task_id: TaskId, error: String) -> bool {
        self.signal(agent_id, task_id, Signal::Failed(error))
    }

    /// The agent produced output for the task.
    pub fn output_received(&self, agent_id: &str, task_id: TaskId) {
        self.signal(agent_id, task_id, Signal::Started);
    }

    pub fn heartbeat(&self, agent_id: &str, current_tasks: &[TaskId]) {
        let inflight = self.inflight.lock();
        for (task_id, entry) in inflight.iter().filter(|(_, e)| e.agent_id == agent_id) {
            let _ = entry.signals.send(Signal::Heartbeat {
                reported: current_tasks.contains(task_id),
            });
        }
    }

    /// Tell every dispatch on `agent_id` that a session closed. Returns the
    /// affected task ids.
    pub fn session_closed(&self, agent_id: &str, replaced: bool) -> Vec<TaskId> {
        let inflight = self.inflight.lock();
        inflight
            .iter()
            .filter(|(_, e)| e.agent_id == agent_id)
            .map(|(task_id, entry)| {
                let _ = entry.signals.send(Signal::SessionClosed { replaced });
                *task_id
            })
            .collect()
    }

    /// Fire a task's cancel handle. Idempotent; `false` if not in flight.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        match self.inflight.lock().get(&task_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, task_id: TaskId) -> bool {
        self.inflight.lock().contains_key(&task_id)
    }

    pub fn agent_for(&self, task_id: TaskId) -> Option<String> {
        self.inflight.lock().get(&task_id).map(|e| e.agent_id.clone())
    }

    pub fn tasks_for_agent(&self, agent_id: &str) -> Vec<TaskId> {
        self.inflight
            .lock()
            .iter()
            .filter(|(_, e)| e.agent_id == agent_id)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Apply a terminal frame for which no dispatch is waiting, e.g. on a
    /// replica that is not the leader. The row is only touched while it is
    /// still in flight on `agent_id`.
    pub async fn settle_unrouted(&self, agent_id: &str, task_id: TaskId, error: Option<String>) -> Result<bool> {
        let Some(task) = task_db::get_task(&self.pool, task_id).await? else {
            debug!(task_id, "terminal frame for unknown task");
            return Ok(false);
        };
        if !task.status.is_in_flight() || task.assigned_agent.as_deref() != Some(agent_id) {
            debug!(task_id, agent_id, status = %task.status, "ignoring terminal frame for task not in flight on this agent");
            return Ok(false);
        }

        let (applied, status, last_line) = match error {
            None => (
                transitions::succeed_task(&self.pool, task_id).await?,
                TaskStatus::Succeeded,
                OutputLine::synthetic(LineKind::Completed, "task completed"),
            ),
            Some(error) => (
                transitions::fail_task(&self.pool, task_id, &error).await?,
                TaskStatus::Failed,
                OutputLine::synthetic(LineKind::Error, error),
            ),
        };
        if applied {
            info!(task_id, agent_id, status = %status, "task finished without a local dispatcher");
            self.settle(&task, status, last_line).await;
        }
        Ok(applied)
    }
}
