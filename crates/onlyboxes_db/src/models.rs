//! Database models for the Onlyboxes console.
//!
//! Derive `FromRow` to map rows to structs; status enums carry a
//! `sqlx::Type` derive so decode validates against the CHECK constraint.

use chrono::{DateTime, SecondsFormat, Utc};
use onlyboxes_protocol::http_types::{TaskError, TaskSnapshot};
use onlyboxes_protocol::{ErrorCode, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Render a timestamp for storage.
///
/// Fixed-width RFC3339 (microseconds, UTC `Z`) so string comparison in
/// SQL matches time order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ============================================================================
// Enums
// ============================================================================

/// Storage form of [`TaskStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TaskStatusColumn {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl From<TaskStatusColumn> for TaskStatus {
    fn from(value: TaskStatusColumn) -> Self {
        match value {
            TaskStatusColumn::Running => TaskStatus::Running,
            TaskStatusColumn::Succeeded => TaskStatus::Succeeded,
            TaskStatusColumn::Failed => TaskStatus::Failed,
            TaskStatusColumn::Canceled => TaskStatus::Canceled,
        }
    }
}

impl From<TaskStatus> for TaskStatusColumn {
    fn from(value: TaskStatus) -> Self {
        match value {
            TaskStatus::Running => TaskStatusColumn::Running,
            TaskStatus::Succeeded => TaskStatusColumn::Succeeded,
            TaskStatus::Failed => TaskStatusColumn::Failed,
            TaskStatus::Canceled => TaskStatusColumn::Canceled,
        }
    }
}

/// Outcome of a heartbeat touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchResult {
    Touched,
    SessionMismatch,
    NodeNotFound,
}

// ============================================================================
// Core models
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub account_id: String,
    pub username: String,
    pub username_key: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token_id: String,
    pub account_id: String,
    pub name: String,
    pub name_key: String,
    pub token_hash: String,
    /// Masked display form (`obx_******xxxx`); the plaintext is never stored.
    pub token_suffix: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkerNodeRow {
    pub node_id: String,
    /// Empty string means no live stream.
    pub session_id: String,
    pub provisioned: bool,
    pub node_name: String,
    pub executor_kind: String,
    pub version: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl WorkerNodeRow {
    /// Online iff a live session exists and the heartbeat is fresh.
    pub fn is_online(&self, now: DateTime<Utc>, offline_ttl: chrono::Duration) -> bool {
        !self.session_id.is_empty() && now - self.last_seen_at <= offline_ttl
    }

    /// Dashboard-only staleness signal.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        now - self.last_seen_at > stale_after
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CapabilityRow {
    pub node_id: String,
    /// Case-preserved name as declared in the hello.
    pub name: String,
    /// Lowercased routing key.
    pub name_key: String,
    pub max_inflight: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct LabelRow {
    pub node_id: String,
    pub label_key: String,
    pub label_value: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct CredentialRow {
    pub node_id: String,
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct OwnerClaimRow {
    pub owner_id: String,
    pub node_id: String,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRow {
    pub task_id: String,
    pub owner_id: String,
    pub request_id: Option<String>,
    pub capability: String,
    pub input_json: String,
    pub status: TaskStatusColumn,
    pub command_id: Option<String>,
    pub result_json: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    pub fn status(&self) -> TaskStatus {
        self.status.into()
    }

    /// Client-visible snapshot of this record.
    pub fn to_snapshot(&self) -> TaskSnapshot {
        let error = self.error_code.as_deref().map(|code| TaskError {
            code: ErrorCode::from_worker_code(code),
            message: self.error_message.clone().unwrap_or_default(),
        });
        let result = self
            .result_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok());
        TaskSnapshot {
            task_id: TaskId::parse(&self.task_id).unwrap_or_default(),
            capability: self.capability.clone(),
            status: self.status(),
            request_id: self.request_id.clone(),
            result,
            error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deadline_at: self.deadline_at,
            completed_at: self.completed_at,
            expires_at: self.expires_at,
            status_url: None,
        }
    }
}
