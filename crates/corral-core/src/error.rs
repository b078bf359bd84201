//! Error kinds surfaced by the coordinator.

use std::time::Duration;

use crate::TaskId;
use crate::protocol::FrameError;

/// Failures the coordinator reports to callers and records on tasks.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("write queue for agent {agent_id} stayed full past the enqueue deadline")]
    Backpressure { agent_id: String },

    #[error("agent {agent_id} disconnected")]
    AgentDisconnected { agent_id: String },

    #[error("agent {agent_id} did not report a terminal frame within {grace:?} of cancel_task")]
    AgentUnresponsive { agent_id: String, grace: Duration },

    #[error("malformed frame: {0}")]
    DecodeError(#[from] FrameError),

    #[error("no heartbeat from agent {agent_id} for {elapsed:?}")]
    StaleHeartbeat { agent_id: String, elapsed: Duration },

    #[error("leader lease lost")]
    LeaderLost,

    #[error("claim on task {task_id} expired before it was confirmed")]
    QueueClaimTimeout { task_id: TaskId },

    #[error("agent {0} has no live session")]
    NotConnected(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl CoordinatorError {
    /// Stable name of the error kind, used as the prefix of task error
    /// messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthFailed(_) => "AuthFailed",
            Self::Backpressure { .. } => "Backpressure",
            Self::AgentDisconnected { .. } => "AgentDisconnected",
            Self::AgentUnresponsive { .. } => "AgentUnresponsive",
            Self::DecodeError(_) => "DecodeError",
            Self::StaleHeartbeat { .. } => "StaleHeartbeat",
            Self::LeaderLost => "LeaderLost",
            Self::QueueClaimTimeout { .. } => "QueueClaimTimeout",
            Self::NotConnected(_) => "NotConnected",
            Self::Store(_) => "Store",
        }
    }

    /// `"<Kind>: <message>"`, the form stored in `tasks.error_message`.
    pub fn task_message(&self) -> String {
        format!("{}: {self}", self.kind())
    }
}
