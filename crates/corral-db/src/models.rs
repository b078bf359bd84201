use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a task.
///
/// `succeeded`, `failed` and `canceled` are terminal and absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Whether no further transition may leave this status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Whether an agent is (or may be) executing the task.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "dispatched" => Ok(Self::Dispatched),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// What the agent is asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Plan,
    Apply,
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskAction {
    type Err = TaskActionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "apply" => Ok(Self::Apply),
            other => Err(TaskActionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskAction`] string.
#[derive(Debug, Clone)]
pub struct TaskActionParseError(pub String);

impl fmt::Display for TaskActionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task action: {:?}", self.0)
    }
}

impl std::error::Error for TaskActionParseError {}

// ---------------------------------------------------------------------------

/// Slot discipline of a task: `plan` occupies one of the agent's plan slots,
/// `plan_and_apply` occupies its single apply slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Plan,
    PlanAndApply,
}

impl TaskType {
    /// The action sent to the agent in `run_task`.
    pub fn action(self) -> TaskAction {
        match self {
            Self::Plan => TaskAction::Plan,
            Self::PlanAndApply => TaskAction::Apply,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::PlanAndApply => "plan_and_apply",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "plan_and_apply" => Ok(Self::PlanAndApply),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// How a pool's agents are provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Long-lived agent processes started by an operator.
    Static,
    /// Agents run as pods; an external scaler drives `desired_count`.
    K8s,
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Static => "static",
            Self::K8s => "k8s",
        };
        f.write_str(s)
    }
}

impl FromStr for PoolType {
    type Err = PoolTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "k8s" => Ok(Self::K8s),
            other => Err(PoolTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PoolType`] string.
#[derive(Debug, Clone)]
pub struct PoolTypeParseError(pub String);

impl fmt::Display for PoolTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pool type: {:?}", self.0)
    }
}

impl std::error::Error for PoolTypeParseError {}

// ---------------------------------------------------------------------------

/// Liveness of an agent as last recorded by a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Outcome of the most recent drift check of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DriftStatus {
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for DriftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A row from the `agent_pools` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentPool {
    pub pool_id: String,
    pub name: String,
    pub pool_type: PoolType,
    pub desired_count: i32,
    pub created_at: DateTime<Utc>,
}

/// A row from the `agents` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub agent_id: String,
    pub name: String,
    pub pool_id: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub status: AgentStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// A row from the `workspaces` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workspace {
    pub workspace_id: String,
    pub name: String,
    pub pool_id: Option<String>,
    pub drift_enabled: bool,
    pub drift_interval_minutes: i32,
    pub drift_window_start: Option<NaiveTime>,
    pub drift_window_end: Option<NaiveTime>,
    pub continue_on_success: bool,
    pub continue_on_failure: bool,
    pub last_drift_at: Option<DateTime<Utc>>,
    pub drift_status: Option<DriftStatus>,
    pub created_at: DateTime<Utc>,
}

/// A row from the `tasks` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: i64,
    pub workspace_id: String,
    pub pool_id: String,
    pub action: TaskAction,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub assigned_agent: Option<String>,
    pub retry_count: i32,
    pub is_drift_check: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A row from the `leases` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
}
