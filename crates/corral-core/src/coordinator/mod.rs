//! The coordinator: wires every component together and is the single
//! receiver of session events.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use corral_db::models::{Agent, AgentStatus, Task, TaskStatus, TaskType};
use corral_db::queries::tasks as task_db;

use crate::TaskId;
use crate::config::CoordinatorConfig;
use crate::credentials::{AckStats, BroadcastReport, CredentialsBroadcaster};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::drift::{DriftGuards, DriftScheduler};
use crate::hub::{HubConfig, OutputHub, StreamStats, Subscription};
use crate::leader::{ElectionConfig, LeaderCallbacks, LeaderElector, LeaseBackend, Leadership};
use crate::protocol::{AgentFrame, CoordinatorFrame, LineKind, OutputLine, TaskRef};
use crate::queue::TaskQueue;
use crate::recovery;
use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;
use crate::session::{
    AgentSession, CloseReason, FrameSink, FrameSource, SessionConfig, SessionEvents, SessionManager,
    SessionStatus, drive,
};
use crate::state::dispatch as transitions;
use crate::token::TokenConfig;

/// What [`Coordinator::cancel_task`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The in-flight cancel handle fired; the agent's terminal frame will
    /// finish the task.
    Signaled,
    /// The task was still queued and is now canceled.
    Canceled,
    /// In flight, but not dispatched from this process.
    NotDispatchedHere,
    AlreadyTerminal,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub leader: bool,
    pub sessions: Vec<SessionStatus>,
    pub in_flight: usize,
    pub tracked_tasks: usize,
    pub drift_guards: usize,
    pub streams: Vec<StreamStats>,
}

pub struct Coordinator {
    pool: PgPool,
    config: CoordinatorConfig,
    session_config: SessionConfig,
    registry: AgentRegistry,
    sessions: Arc<SessionManager>,
    hub: Arc<OutputHub>,
    queue: Arc<TaskQueue>,
    guards: Arc<DriftGuards>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    drift: Arc<DriftScheduler>,
    credentials: CredentialsBroadcaster,
    leadership: Leadership,
}

impl Coordinator {
    pub fn new(pool: PgPool, tokens: TokenConfig, config: CoordinatorConfig) -> Arc<Self> {
        let sessions = Arc::new(SessionManager::new(config.replace_close_wait));
        let hub = Arc::new(OutputHub::new(HubConfig::from(&config)));
        let queue = Arc::new(TaskQueue::new(pool.clone(), config.claim_lease));
        let guards = Arc::new(DriftGuards::default());
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            Arc::clone(&queue),
            Arc::clone(&sessions),
            Arc::clone(&hub),
            Arc::clone(&guards),
            DispatcherConfig::from(&config),
        ));
        let scheduler = Arc::new(Scheduler::new(
            pool.clone(),
            Arc::clone(&queue),
            Arc::clone(&sessions),
            Arc::clone(&dispatcher),
            config.schedule_tick,
        ));
        let drift = Arc::new(DriftScheduler::new(
            pool.clone(),
            Arc::clone(&queue),
            Arc::clone(&guards),
            config.drift_tick,
        ));

        Arc::new(Self {
            registry: AgentRegistry::new(pool.clone(), tokens),
            credentials: CredentialsBroadcaster::new(Arc::clone(&sessions)),
            session_config: SessionConfig::from(&config),
            leadership: Leadership::default(),
            pool,
            config,
            sessions,
            hub,
            queue,
            guards,
            dispatcher,
            scheduler,
            drift,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn hub(&self) -> &Arc<OutputHub> {
        &self.hub
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn drift(&self) -> &Arc<DriftScheduler> {
        &self.drift
    }

    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    /// Serve an authenticated agent's control connection until it closes.
    pub async fn connect_agent(
        self: &Arc<Self>,
        agent: &Agent,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
    ) -> CloseReason {
        let (session, driver) = AgentSession::open(&agent.agent_id, &agent.pool_id, &self.session_config);
        self.sessions.attach(Arc::clone(&session)).await;
        if let Err(e) = self.registry.set_status(&agent.agent_id, AgentStatus::Online).await {
            warn!(agent_id = %agent.agent_id, error = %e, "failed to mark agent online");
        }
        let events: Arc<dyn SessionEvents> = Arc::clone(self) as Arc<dyn SessionEvents>;
        drive(session, driver, sink, source, events).await
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    pub async fn submit_task(&self, workspace_id: &str, task_type: TaskType) -> Result<Task> {
        self.queue.submit(workspace_id, task_type, false).await
    }

    /// Cancel a task. In flight: fire its cancel handle. Still queued:
    /// mark it canceled right away.
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<CancelOutcome> {
        if self.dispatcher.cancel(task_id) {
            info!(task_id, "cancel requested");
            return Ok(CancelOutcome::Signaled);
        }
        let Some(task) = task_db::get_task(&self.pool, task_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        match task.status {
            TaskStatus::Queued => {
                if !transitions::cancel_queued_task(&self.pool, task_id).await? {
                    // Dispatched in the meantime.
                    return Ok(if self.dispatcher.cancel(task_id) {
                        CancelOutcome::Signaled
                    } else {
                        CancelOutcome::NotDispatchedHere
                    });
                }
                info!(task_id, "queued task canceled");
                self.queue.mark_terminal(task_id);
                self.hub
                    .finish(task_id, OutputLine::synthetic(LineKind::Canceled, "task canceled"));
                self.guards.finish(&self.pool, &task, TaskStatus::Canceled).await?;
                Ok(CancelOutcome::Canceled)
            }
            status if status.is_terminal() => Ok(CancelOutcome::AlreadyTerminal),
            _ => Ok(CancelOutcome::NotDispatchedHere),
        }
    }

    // -----------------------------------------------------------------------
    // Output streams
    // -----------------------------------------------------------------------

    /// Subscribe to a task's output. The first subscriber of an in-flight
    /// task asks the agent to start streaming.
    pub fn subscribe_output(&self, task_id: TaskId, client_id: &str) -> Subscription {
        let subscription = self.hub.subscribe(task_id, client_id);
        if subscription.first {
            self.send_to_task_agent(task_id, CoordinatorFrame::StartRealtimeStream(TaskRef { task_id }));
        }
        subscription
    }

    /// Drop a subscriber. The last one leaving stops the agent's stream.
    pub fn unsubscribe_output(&self, task_id: TaskId, client_id: &str) {
        if self.hub.unsubscribe(task_id, client_id) == Some(0) {
            self.send_to_task_agent(task_id, CoordinatorFrame::StopRealtimeStream(TaskRef { task_id }));
        }
    }

    fn send_to_task_agent(&self, task_id: TaskId, frame: CoordinatorFrame) {
        let Some(session) = self
            .dispatcher
            .agent_for(task_id)
            .and_then(|agent_id| self.sessions.get(&agent_id))
        else {
            return;
        };
        let frame_type = frame.frame_type();
        if let Err(e) = session.try_enqueue(frame) {
            warn!(task_id, agent_id = %session.agent_id(), frame_type, error = %e, "stream control frame not sent");
        }
    }

    // -----------------------------------------------------------------------
    // Credentials
    // -----------------------------------------------------------------------

    pub fn broadcast_credentials(&self, pool_id: &str) -> BroadcastReport {
        self.credentials.broadcast(pool_id)
    }

    pub fn credential_acks(&self, pool_id: &str) -> AckStats {
        self.credentials.acks(pool_id)
    }

    pub fn status(&self) -> CoordinatorStatus {
        let mut sessions: Vec<SessionStatus> = self.sessions.all().iter().map(|s| s.status()).collect();
        sessions.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        CoordinatorStatus {
            leader: self.is_leader(),
            sessions,
            in_flight: self.dispatcher.in_flight_count(),
            tracked_tasks: self.queue.tracked_len(),
            drift_guards: self.guards.len(),
            streams: self.hub.stats(),
        }
    }

    // -----------------------------------------------------------------------
    // Background work
    // -----------------------------------------------------------------------

    /// Run housekeeping and the leader election until `cancel` fires, then
    /// close every session.
    pub async fn run(self: Arc<Self>, backend: Arc<dyn LeaseBackend>, holder: String, cancel: CancellationToken) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let janitor = tokio::spawn(Arc::clone(&self.hub).run_janitor(
            self.config.stream_janitor_interval,
            move |task_id| dispatcher.is_in_flight(task_id),
            cancel.child_token(),
        ));
        let claims = tokio::spawn(
            Arc::clone(&self.queue).run_claim_sweeper(self.config.heartbeat_check_interval, cancel.child_token()),
        );
        let offline = tokio::spawn(Arc::clone(&self).run_offline_sweeper(cancel.child_token()));

        let elector = LeaderElector::new(
            backend,
            ElectionConfig::from_coordinator(&self.config, holder),
            self.leadership.clone(),
        );
        let callbacks: Arc<dyn LeaderCallbacks> = Arc::new(LeaderHooks(Arc::clone(&self)));
        elector.run(callbacks, cancel.clone()).await;

        let _ = tokio::join!(janitor, claims, offline);
        self.sessions.close_all();
        info!("coordinator stopped");
    }

    async fn run_offline_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.offline_sweep_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let live = self.sessions.agent_ids();
                    if let Err(e) = self.registry.sweep_offline(&live, self.config.offline_after).await {
                        warn!(error = %e, "offline sweep failed");
                    }
                }
            }
        }
    }

    /// Requeue orphans and start the scheduling loops for one leadership
    /// epoch.
    pub async fn lead(self: Arc<Self>, epoch: CancellationToken) {
        let report = recovery::recover(
            &self.pool,
            &self.sessions,
            &self.dispatcher,
            &self.queue,
            &self.guards,
            self.config.heartbeat_stale_after,
        )
        .await;
        if let Err(e) = report {
            error!(error = %e, "recovery failed, scheduling anyway");
        }
        if epoch.is_cancelled() {
            return;
        }
        let scheduler = tokio::spawn(Arc::clone(&self.scheduler).run(epoch.child_token()));
        let drift = tokio::spawn(Arc::clone(&self.drift).run(epoch.child_token()));
        let _ = tokio::join!(scheduler, drift);
    }

    // -----------------------------------------------------------------------
    // Frame handling
    // -----------------------------------------------------------------------

    async fn on_terminal(&self, agent_id: &str, task_id: TaskId, error: Option<String>) {
        let routed = match &error {
            None => self.dispatcher.complete(agent_id, task_id),
            Some(e) => self.dispatcher.fail(agent_id, task_id, e.clone()),
        };
        if routed {
            return;
        }
        if let Err(e) = self.dispatcher.settle_unrouted(agent_id, task_id, error).await {
            error!(task_id, agent_id, error = %e, "failed to apply terminal frame");
        }
    }

    /// Whether `agent_id` may write into the task's output stream: the task
    /// is in flight on it here, or (with no local dispatch) in the store.
    async fn owns_output(&self, agent_id: &str, task_id: TaskId) -> bool {
        match self.dispatcher.agent_for(task_id) {
            Some(assigned) if assigned == agent_id => return true,
            Some(assigned) => {
                warn!(task_id, agent_id, assigned = %assigned, "dropping output from an agent the task is not assigned to");
                return false;
            }
            None => {}
        }
        match task_db::get_task(&self.pool, task_id).await {
            Ok(Some(task)) if task.status.is_in_flight() && task.assigned_agent.as_deref() == Some(agent_id) => true,
            Ok(_) => {
                debug!(task_id, agent_id, "dropping output for a task not in flight on this agent");
                false
            }
            Err(e) => {
                warn!(task_id, agent_id, error = %e, "failed to look up task for output");
                false
            }
        }
    }

    fn check_reported_tasks(&self, agent_id: &str, reported: &[TaskId]) {
        if !self.is_leader() {
            return;
        }
        let known: HashSet<TaskId> = self.dispatcher.tasks_for_agent(agent_id).into_iter().collect();
        let unknown: Vec<TaskId> = reported.iter().copied().filter(|id| !known.contains(id)).collect();
        if !unknown.is_empty() {
            warn!(agent_id, tasks = ?unknown, "agent reports tasks not dispatched to it");
        }
    }
}

#[async_trait]
impl SessionEvents for Coordinator {
    async fn on_frame(&self, session: &Arc<AgentSession>, frame: AgentFrame) {
        let agent_id = session.agent_id();
        match frame {
            AgentFrame::Heartbeat(hb) => {
                if let Err(e) = self.registry.mark_seen(agent_id, Utc::now()).await {
                    warn!(agent_id, error = %e, "failed to record heartbeat");
                }
                self.dispatcher.heartbeat(agent_id, &hb.current_tasks);
                self.check_reported_tasks(agent_id, &hb.current_tasks);
                self.queue.notify(session.pool_id());
            }
            AgentFrame::LogStream(log) => {
                let task_id = log.task_id;
                if self.owns_output(agent_id, task_id).await {
                    self.hub.publish(task_id, OutputLine::from_log(log, Utc::now()));
                    self.dispatcher.output_received(agent_id, task_id);
                }
            }
            AgentFrame::TaskCompleted(done) => self.on_terminal(agent_id, done.task_id, None).await,
            AgentFrame::TaskFailed(failed) => {
                self.on_terminal(agent_id, failed.task_id, Some(failed.error)).await;
            }
            AgentFrame::CredentialsRefreshed(ack) => {
                self.credentials.record_ack(agent_id, session.pool_id(), &ack);
            }
        }
    }

    async fn on_closed(&self, session: &Arc<AgentSession>, reason: CloseReason) {
        let agent_id = session.agent_id();
        let was_current = self.sessions.detach(session);
        let replaced = reason == CloseReason::Replaced || !was_current;

        if !replaced {
            if let Err(e) = self.registry.set_status(agent_id, AgentStatus::Offline).await {
                warn!(agent_id, error = %e, "failed to mark agent offline");
            }
        }

        let tasks = self.dispatcher.session_closed(agent_id, replaced);
        for task_id in &tasks {
            self.hub.end_subscribers(*task_id);
        }
        debug!(agent_id, reason = %reason, replaced, in_flight = tasks.len(), "session close handled");
        self.queue.notify(session.pool_id());
    }
}

struct LeaderHooks(Arc<Coordinator>);

#[async_trait]
impl LeaderCallbacks for LeaderHooks {
    async fn on_started_leading(&self, epoch: CancellationToken) {
        info!("leadership acquired, recovering");
        tokio::spawn(Arc::clone(&self.0).lead(epoch));
    }

    async fn on_stopped_leading(&self) {
        info!(
            in_flight = self.0.dispatcher.in_flight_count(),
            "leadership lost, scheduling stopped"
        );
    }
}
