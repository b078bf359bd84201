//! Agent sessions: one per connected agent.
//!
//! A session owns its transport for its lifetime. Outbound frames go
//! through a bounded write queue drained by a single writer, so frames
//! reach the agent in enqueue order. Inbound frames are decoded by the
//! read loop and handed to [`SessionEvents`]. A monitor closes the session
//! when heartbeats stop.

pub mod manager;
pub mod transport;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corral_db::models::TaskType;

use crate::TaskId;
use crate::capacity::{CapacitySnapshot, Reservations, can_accept};
use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::protocol::{AgentFrame, CoordinatorFrame, FrameError, Heartbeat};

pub use manager::SessionManager;
pub use transport::{FrameSink, FrameSource, MemoryAgent, memory_transport};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-session settings, taken from [`CoordinatorConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub write_queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub stale_after: Duration,
    pub first_heartbeat_timeout: Duration,
    pub check_interval: Duration,
    pub default_plan_limit: u32,
}

impl From<&CoordinatorConfig> for SessionConfig {
    fn from(c: &CoordinatorConfig) -> Self {
        Self {
            write_queue_capacity: c.write_queue_capacity,
            enqueue_timeout: c.enqueue_timeout,
            stale_after: c.heartbeat_stale_after,
            first_heartbeat_timeout: c.first_heartbeat_timeout,
            check_interval: c.heartbeat_check_interval,
            default_plan_limit: c.default_plan_limit,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    PeerClosed,
    ReadError,
    WriteError,
    StaleHeartbeat,
    NoFirstHeartbeat,
    Replaced,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeerClosed => "peer closed",
            Self::ReadError => "read error",
            Self::WriteError => "write error",
            Self::StaleHeartbeat => "stale heartbeat",
            Self::NoFirstHeartbeat => "no first heartbeat",
            Self::Replaced => "replaced by a new connection",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Receiver of everything a session reads, and of its close.
#[async_trait]
pub trait SessionEvents: Send + Sync {
    /// A decoded inbound frame. Heartbeats have already been applied to the
    /// session's capacity snapshot when this is called.
    async fn on_frame(&self, session: &Arc<AgentSession>, frame: AgentFrame);

    /// Called once, after all session loops have stopped.
    async fn on_closed(&self, session: &Arc<AgentSession>, reason: CloseReason);
}

/// A heartbeat is stale only when strictly more than `threshold` has passed.
pub fn is_stale(last: Instant, now: Instant, threshold: Duration) -> bool {
    now.saturating_duration_since(last) > threshold
}

struct SlotState {
    snapshot: CapacitySnapshot,
    reservations: Reservations,
    last_heartbeat: Option<Instant>,
}

pub struct AgentSession {
    id: u64,
    agent_id: String,
    pool_id: String,
    connected_at: Instant,
    outbound: mpsc::Sender<CoordinatorFrame>,
    enqueue_timeout: Duration,
    slots: Mutex<SlotState>,
    close: CancellationToken,
    finished: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

/// The receiving end of a session's write queue, consumed by [`drive`].
pub struct SessionDriver {
    rx: mpsc::Receiver<CoordinatorFrame>,
    config: SessionConfig,
}

/// Serializable view of a session for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: u64,
    pub agent_id: String,
    pub pool_id: String,
    pub connected_secs: u64,
    pub last_heartbeat_ms_ago: Option<u64>,
    pub capacity: CapacitySnapshot,
    pub reserved_tasks: Vec<TaskId>,
}

impl AgentSession {
    pub fn open(agent_id: &str, pool_id: &str, config: &SessionConfig) -> (Arc<Self>, SessionDriver) {
        let (tx, rx) = mpsc::channel(config.write_queue_capacity.max(1));
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            agent_id: agent_id.to_string(),
            pool_id: pool_id.to_string(),
            connected_at: Instant::now(),
            outbound: tx,
            enqueue_timeout: config.enqueue_timeout,
            slots: Mutex::new(SlotState {
                snapshot: CapacitySnapshot::initial(config.default_plan_limit),
                reservations: Reservations::default(),
                last_heartbeat: None,
            }),
            close: CancellationToken::new(),
            finished: CancellationToken::new(),
            close_reason: Mutex::new(None),
        });
        let driver = SessionDriver {
            rx,
            config: config.clone(),
        };
        (session, driver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    // -- write queue --------------------------------------------------------

    /// Queue a frame, waiting at most the enqueue deadline for room.
    pub async fn enqueue(&self, frame: CoordinatorFrame) -> Result<(), CoordinatorError> {
        if self.is_closed() {
            return Err(self.disconnected());
        }
        tokio::select! {
            res = self.outbound.send_timeout(frame, self.enqueue_timeout) => match res {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(agent_id = %self.agent_id, "write queue full, frame rejected");
                    Err(CoordinatorError::Backpressure { agent_id: self.agent_id.clone() })
                }
                Err(SendTimeoutError::Closed(_)) => Err(self.disconnected()),
            },
            _ = self.close.cancelled() => Err(self.disconnected()),
        }
    }

    /// Queue a frame only if there is room right now.
    pub fn try_enqueue(&self, frame: CoordinatorFrame) -> Result<(), CoordinatorError> {
        if self.is_closed() {
            return Err(self.disconnected());
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(CoordinatorError::Backpressure {
                agent_id: self.agent_id.clone(),
            }),
            Err(TrySendError::Closed(_)) => Err(self.disconnected()),
        }
    }

    fn disconnected(&self) -> CoordinatorError {
        CoordinatorError::AgentDisconnected {
            agent_id: self.agent_id.clone(),
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Ask all session loops to stop. The first reason given wins.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Resolves once [`drive`] has returned.
    pub async fn wait_finished(&self) {
        self.finished.cancelled().await;
    }

    // -- capacity -----------------------------------------------------------

    pub fn snapshot(&self) -> CapacitySnapshot {
        self.slots.lock().snapshot.clone()
    }

    pub fn reservation_count(&self) -> usize {
        self.slots.lock().reservations.len()
    }

    pub fn has_heartbeat(&self) -> bool {
        self.slots.lock().last_heartbeat.is_some()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.slots.lock().last_heartbeat
    }

    pub fn can_accept(&self, task_type: TaskType) -> bool {
        let slots = self.slots.lock();
        can_accept(&slots.snapshot, &slots.reservations, task_type)
    }

    /// Atomically check capacity and reserve a slot for `task_id`.
    pub fn try_reserve(&self, task_id: TaskId, task_type: TaskType) -> bool {
        let mut slots = self.slots.lock();
        if !can_accept(&slots.snapshot, &slots.reservations, task_type) {
            return false;
        }
        slots.reservations.insert(task_id, task_type);
        true
    }

    /// Drop a reservation. Returns whether one was held.
    pub fn release_reservation(&self, task_id: TaskId) -> bool {
        self.slots.lock().reservations.remove(task_id)
    }

    pub fn is_reserved(&self, task_id: TaskId) -> bool {
        self.slots.lock().reservations.contains(task_id)
    }

    /// Whether the latest heartbeat lists `task_id`; `None` before the
    /// first heartbeat.
    pub fn reports_task(&self, task_id: TaskId) -> Option<bool> {
        let slots = self.slots.lock();
        slots.last_heartbeat?;
        Some(slots.snapshot.current_tasks.contains(&task_id))
    }

    /// Replace the capacity snapshot. Reservations for tasks the agent now
    /// lists as running are acknowledged and dropped; their ids are returned.
    pub fn apply_heartbeat(&self, hb: &Heartbeat, now: Instant) -> Vec<TaskId> {
        let mut slots = self.slots.lock();
        slots.snapshot = CapacitySnapshot::from_heartbeat(hb);
        slots.last_heartbeat = Some(now);
        let acked: Vec<TaskId> = hb
            .current_tasks
            .iter()
            .copied()
            .filter(|id| slots.reservations.contains(*id))
            .collect();
        for id in &acked {
            slots.reservations.remove(*id);
        }
        acked
    }

    pub fn status(&self) -> SessionStatus {
        let now = Instant::now();
        let slots = self.slots.lock();
        SessionStatus {
            session_id: self.id,
            agent_id: self.agent_id.clone(),
            pool_id: self.pool_id.clone(),
            connected_secs: now.saturating_duration_since(self.connected_at).as_secs(),
            last_heartbeat_ms_ago: slots
                .last_heartbeat
                .map(|t| u64::try_from(now.saturating_duration_since(t).as_millis()).unwrap_or(u64::MAX)),
            capacity: slots.snapshot.clone(),
            reserved_tasks: slots.reservations.task_ids(),
        }
    }
}

/// Run a session until it closes: writer, reader and heartbeat monitor run
/// concurrently and all stop on the session's close token.
pub async fn drive(
    session: Arc<AgentSession>,
    driver: SessionDriver,
    sink: Box<dyn FrameSink>,
    source: Box<dyn FrameSource>,
    events: Arc<dyn SessionEvents>,
) -> CloseReason {
    let SessionDriver { rx, config } = driver;
    info!(agent_id = %session.agent_id, session_id = session.id, "session started");

    tokio::join!(
        write_loop(&session, rx, sink),
        read_loop(&session, source, events.as_ref()),
        heartbeat_monitor(&session, &config),
    );

    let reason = session.close_reason().unwrap_or(CloseReason::Shutdown);
    info!(
        agent_id = %session.agent_id,
        session_id = session.id,
        reason = %reason,
        "session closed"
    );
    events.on_closed(&session, reason).await;
    session.finished.cancel();
    reason
}

async fn write_loop(
    session: &AgentSession,
    mut rx: mpsc::Receiver<CoordinatorFrame>,
    mut sink: Box<dyn FrameSink>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = session.close.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(agent_id = %session.agent_id, error = %e, "dropping unencodable frame");
                continue;
            }
        };

        let sent = tokio::select! {
            res = sink.send(text) => res,
            _ = session.close.cancelled() => break,
        };
        if let Err(e) = sent {
            warn!(agent_id = %session.agent_id, error = %e, "write failed");
            session.close(CloseReason::WriteError);
            break;
        }
        debug!(agent_id = %session.agent_id, frame = frame.frame_type(), "frame written");
    }

    // Unwritten frames are dropped with the queue.
    rx.close();
    sink.close().await;
}

async fn read_loop(
    session: &Arc<AgentSession>,
    mut source: Box<dyn FrameSource>,
    events: &dyn SessionEvents,
) {
    loop {
        let next = tokio::select! {
            _ = session.close.cancelled() => break,
            next = source.recv() => next,
        };

        let text = match next {
            None => {
                session.close(CloseReason::PeerClosed);
                break;
            }
            Some(Err(e)) => {
                warn!(agent_id = %session.agent_id, error = %e, "read failed");
                session.close(CloseReason::ReadError);
                break;
            }
            Some(Ok(text)) => text,
        };

        let frame = match AgentFrame::decode(&text) {
            Ok(frame) => frame,
            Err(FrameError::UnknownType(frame_type)) => {
                warn!(agent_id = %session.agent_id, frame_type = %frame_type, "discarding frame of unknown type");
                continue;
            }
            Err(e) => {
                let err = CoordinatorError::DecodeError(e);
                warn!(agent_id = %session.agent_id, error = %err, "skipping undecodable frame");
                continue;
            }
        };

        if let AgentFrame::Heartbeat(hb) = &frame {
            session.apply_heartbeat(hb, Instant::now());
        }
        events.on_frame(session, frame).await;
    }
}

async fn heartbeat_monitor(session: &AgentSession, config: &SessionConfig) {
    let first_deadline = session.connected_at + config.first_heartbeat_timeout;
    loop {
        tokio::select! {
            _ = session.close.cancelled() => break,
            _ = tokio::time::sleep(config.check_interval) => {}
        }
        let now = Instant::now();
        match session.last_heartbeat() {
            None if now > first_deadline => {
                warn!(agent_id = %session.agent_id, "no heartbeat since connect");
                session.close(CloseReason::NoFirstHeartbeat);
                break;
            }
            None => {}
            Some(last) if is_stale(last, now, config.stale_after) => {
                let err = CoordinatorError::StaleHeartbeat {
                    agent_id: session.agent_id.clone(),
                    elapsed: now.saturating_duration_since(last),
                };
                warn!(agent_id = %session.agent_id, error = %err, "closing stale session");
                session.close(CloseReason::StaleHeartbeat);
                break;
            }
            Some(_) => {}
        }
    }
}
