//! Canonical enums and small value types used across all crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Label key carrying the owning account of a worker node.
///
/// System-controlled: once set on a provisioned node it is never
/// overwritten by worker-supplied hello labels.
pub const LABEL_OWNER_ID: &str = "obx.owner_id";

/// Label key carrying the worker type (`normal` | `worker-sys`).
///
/// System-controlled, same rule as [`LABEL_OWNER_ID`].
pub const LABEL_WORKER_TYPE: &str = "obx.worker_type";

/// Well-known capability names at the system boundary.
///
/// The console never interprets these beyond routing; the constants
/// exist so the commands API and the workers agree on spelling.
pub mod capabilities {
    pub const ECHO: &str = "echo";
    pub const PYTHON_EXEC: &str = "pythonExec";
    pub const TERMINAL_EXEC: &str = "terminalExec";
    pub const COMPUTER_USE: &str = "computerUse";
    pub const TERMINAL_RESOURCE: &str = "terminalResource";
}

/// Normalize a capability name for routing and inflight accounting.
///
/// Capabilities are matched case-insensitively but stored case-preserved;
/// every boundary into the routing query or the inflight tracker goes
/// through this function.
pub fn capability_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// A capability a worker advertises in its hello, with its admission cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDecl {
    pub name: String,
    pub max_inflight: u32,
}

/// Worker type policy.
///
/// `worker-sys` executes directly on a host: limited to one per account
/// and single-flight by policy. This is the CANONICAL definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WorkerType {
    #[default]
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "worker-sys")]
    WorkerSys,
}

impl WorkerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerType::Normal => "normal",
            WorkerType::WorkerSys => "worker-sys",
        }
    }
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(WorkerType::Normal),
            "worker-sys" => Ok(WorkerType::WorkerSys),
            _ => Err(format!(
                "Invalid worker type: '{}'. Expected: normal or worker-sys",
                s
            )),
        }
    }
}

/// Task lifecycle status. This is the CANONICAL definition.
///
/// A deadline expiry is represented as `Failed` with
/// [`ErrorCode::DeadlineExceeded`]; there is no separate timeout status
/// in storage, the HTTP layer derives 504 from the error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub const ALL: &'static [TaskStatus] = &[
        TaskStatus::Running,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Terminal statuses are immutable once written.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid task status: {0}")]
pub struct TaskStatusParseError(String);

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TaskStatusParseError(s.to_string()))
    }
}

/// Submission mode for the tasks API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    Sync,
    Async,
    #[default]
    Auto,
}

/// Wire error taxonomy carried inside `task.error.code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoWorker,
    NoCapacity,
    DeadlineExceeded,
    WorkerDisconnected,
    SessionNotFound,
    SessionBusy,
    InvalidPayload,
    ExecutionFailed,
    ConsoleRestarted,
    RequestIdInProgress,
}

impl ErrorCode {
    pub const ALL: &'static [ErrorCode] = &[
        ErrorCode::NoWorker,
        ErrorCode::NoCapacity,
        ErrorCode::DeadlineExceeded,
        ErrorCode::WorkerDisconnected,
        ErrorCode::SessionNotFound,
        ErrorCode::SessionBusy,
        ErrorCode::InvalidPayload,
        ErrorCode::ExecutionFailed,
        ErrorCode::ConsoleRestarted,
        ErrorCode::RequestIdInProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoWorker => "no_worker",
            ErrorCode::NoCapacity => "no_capacity",
            ErrorCode::DeadlineExceeded => "deadline_exceeded",
            ErrorCode::WorkerDisconnected => "worker_disconnected",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::SessionBusy => "session_busy",
            ErrorCode::InvalidPayload => "invalid_payload",
            ErrorCode::ExecutionFailed => "execution_failed",
            ErrorCode::ConsoleRestarted => "console_restarted",
            ErrorCode::RequestIdInProgress => "request_id_in_progress",
        }
    }

    /// Map an error string reported by a worker to the taxonomy.
    ///
    /// Unknown codes collapse to `execution_failed`; the original string
    /// is kept in the error message, not the code.
    pub fn from_worker_code(code: &str) -> Self {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|known| known.as_str() == code)
            .unwrap_or(ErrorCode::ExecutionFailed)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown error code: {0}")]
pub struct ErrorCodeParseError(String);

impl FromStr for ErrorCode {
    type Err = ErrorCodeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| ErrorCodeParseError(s.to_string()))
    }
}
