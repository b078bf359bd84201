//! Control-channel frame grammar.
//!
//! Every frame is a JSON object `{"type": "<name>", "payload": {...}}`.
//! Decoding reads the envelope first so an unrecognised `type` can be told
//! apart from a recognised frame with a malformed payload: the former is
//! skipped, the latter is a decode error.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use corral_db::models::TaskAction;

use crate::TaskId;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not a typed JSON envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("unknown frame type {0:?}")]
    UnknownType(String),

    #[error("invalid {frame_type} payload: {source}")]
    Payload {
        frame_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    frame_type: String,
}

/// Agent timestamps arrive either as RFC 3339 strings or as unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTime {
    Rfc3339(DateTime<Utc>),
    Unix(i64),
}

impl WireTime {
    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Rfc3339(t) => Some(t),
            Self::Unix(secs) => Utc.timestamp_opt(secs, 0).single(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent -> coordinator
// ---------------------------------------------------------------------------

/// Capacity and health report sent by the agent every 10 seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub plan_running: u32,
    pub plan_limit: u32,
    pub apply_running: bool,
    #[serde(default)]
    pub current_tasks: Vec<TaskId>,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub mem_usage: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailed {
    pub task_id: TaskId,
    pub error: String,
}

/// Kind of an output line. Unrecognised kinds are treated as plain output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineKind {
    Error,
    Completed,
    StageMarker,
    Canceled,
    #[serde(other)]
    Output,
}

/// One line of task output as sent by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStream {
    pub task_id: TaskId,
    #[serde(rename = "type", default = "default_line_kind")]
    pub kind: LineKind,
    #[serde(default)]
    pub line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_num: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

fn default_line_kind() -> LineKind {
    LineKind::Output
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsAck {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub pool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<WireTime>,
    #[serde(default)]
    pub count: u32,
}

/// Frames an agent may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum AgentFrame {
    Heartbeat(Heartbeat),
    TaskCompleted(TaskCompleted),
    TaskFailed(TaskFailed),
    LogStream(LogStream),
    CredentialsRefreshed(CredentialsAck),
}

impl AgentFrame {
    const TYPES: &'static [&'static str] = &[
        "heartbeat",
        "task_completed",
        "task_failed",
        "log_stream",
        "credentials_refreshed",
    ];

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        decode_typed(text, Self::TYPES)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::Heartbeat(_) => "heartbeat",
            Self::TaskCompleted(_) => "task_completed",
            Self::TaskFailed(_) => "task_failed",
            Self::LogStream(_) => "log_stream",
            Self::CredentialsRefreshed(_) => "credentials_refreshed",
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator -> agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTask {
    pub task_id: TaskId,
    pub workspace_id: String,
    pub action: TaskAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRef {
    pub task_id: TaskId,
}

/// Tells an agent to re-fetch its pool's credentials now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshCredentials {
    pub pool_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Frames the coordinator sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CoordinatorFrame {
    RunTask(RunTask),
    CancelTask(TaskRef),
    StartRealtimeStream(TaskRef),
    StopRealtimeStream(TaskRef),
    RefreshCredentials(RefreshCredentials),
}

impl CoordinatorFrame {
    const TYPES: &'static [&'static str] = &[
        "run_task",
        "cancel_task",
        "start_realtime_stream",
        "stop_realtime_stream",
        "refresh_credentials",
    ];

    pub fn cancel(task_id: TaskId) -> Self {
        Self::CancelTask(TaskRef { task_id })
    }

    pub fn refresh_credentials(pool_id: &str) -> Self {
        Self::RefreshCredentials(RefreshCredentials {
            pool_id: pool_id.to_string(),
            timestamp: Utc::now(),
        })
    }

    pub fn decode(text: &str) -> Result<Self, FrameError> {
        decode_typed(text, Self::TYPES)
    }

    pub fn encode(&self) -> Result<String, FrameError> {
        serde_json::to_string(self).map_err(FrameError::Encode)
    }

    pub fn frame_type(&self) -> &'static str {
        match self {
            Self::RunTask(_) => "run_task",
            Self::CancelTask(_) => "cancel_task",
            Self::StartRealtimeStream(_) => "start_realtime_stream",
            Self::StopRealtimeStream(_) => "stop_realtime_stream",
            Self::RefreshCredentials(_) => "refresh_credentials",
        }
    }
}

fn decode_typed<T: serde::de::DeserializeOwned>(
    text: &str,
    known: &[&str],
) -> Result<T, FrameError> {
    let value: Value = serde_json::from_str(text).map_err(FrameError::Envelope)?;
    let envelope: Envelope = Envelope::deserialize(&value).map_err(FrameError::Envelope)?;
    if !known.contains(&envelope.frame_type.as_str()) {
        return Err(FrameError::UnknownType(envelope.frame_type));
    }
    serde_json::from_value(value).map_err(|source| FrameError::Payload {
        frame_type: envelope.frame_type,
        source,
    })
}

// ---------------------------------------------------------------------------
// Subscriber view
// ---------------------------------------------------------------------------

/// An output line as delivered to end-user subscribers, stamped by the
/// coordinator on receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    #[serde(rename = "type")]
    pub kind: LineKind,
    pub line: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_num: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl OutputLine {
    pub fn from_log(log: LogStream, received_at: DateTime<Utc>) -> Self {
        Self {
            kind: log.kind,
            line: log.line,
            timestamp: received_at,
            line_num: log.line_num,
            stage: log.stage,
            status: log.status,
        }
    }

    /// A coordinator-generated line that closes a stream.
    pub fn synthetic(kind: LineKind, line: impl Into<String>) -> Self {
        Self {
            kind,
            line: line.into(),
            timestamp: Utc::now(),
            line_num: None,
            stage: None,
            status: None,
        }
    }
}
