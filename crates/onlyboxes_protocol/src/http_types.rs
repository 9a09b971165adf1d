//! HTTP API types for the console REST surface.
//!
//! These types are shared by the axum handlers and any client (dashboard,
//! CLI, MCP tools). All timestamps serialize as RFC3339 via chrono.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::ids::{AccountId, NodeId, TaskId, TokenId};
use crate::types::{CapabilityDecl, ErrorCode, SubmitMode, TaskStatus, WorkerType};

/// Uniform JSON error envelope: `{"error": "..."}` with minimal detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

// ============================================================================
// Dashboard: accounts and sessions
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: AccountId,
    pub username: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub account: AccountInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAccountRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPage {
    pub accounts: Vec<AccountInfo>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

// ============================================================================
// Dashboard: access tokens
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token_id: TokenId,
    pub name: String,
    /// Masked display form, e.g. `obx_******1f2e`.
    pub masked: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    pub name: String,
}

/// The plaintext token is returned exactly once, here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    pub token_id: TokenId,
    pub name: String,
    pub token: String,
    pub masked: String,
}

// ============================================================================
// Workers
// ============================================================================

/// Status filter for the worker list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatusFilter {
    #[default]
    All,
    Online,
    Offline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerListQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub status: Option<WorkerStatusFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub node_id: NodeId,
    pub node_name: String,
    pub executor_kind: String,
    pub version: String,
    pub worker_type: Option<WorkerType>,
    pub owner_id: Option<AccountId>,
    pub provisioned: bool,
    pub online: bool,
    pub stale: bool,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Case-preserved capability names as declared in the hello.
    pub capabilities: Vec<CapabilityDecl>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPage {
    pub workers: Vec<WorkerInfo>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerStatsQuery {
    #[serde(default)]
    pub stale_after_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub total: u64,
    pub online: u64,
    pub offline: u64,
    /// Online workers whose heartbeat is older than `stale_after_sec`.
    pub stale: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InflightEntry {
    pub node_id: NodeId,
    pub capability: String,
    pub inflight: u32,
    pub max_inflight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InflightSnapshot {
    pub entries: Vec<InflightEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkerRequest {
    #[serde(rename = "type")]
    pub worker_type: WorkerType,
}

/// `command` embeds the one-time plaintext secret; it is never shown again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkerResponse {
    pub node_id: NodeId,
    #[serde(rename = "type")]
    pub worker_type: WorkerType,
    pub command: String,
}

// ============================================================================
// Commands (bearer): thin one-shot RPCs without task rows
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoRequest {
    pub message: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalRequest {
    pub command: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub create_if_missing: Option<bool>,
    #[serde(default)]
    pub lease_ttl_sec: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputerUseRequest {
    /// Opaque action payload forwarded to the worker.
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// ============================================================================
// Tasks (bearer)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskRequest {
    pub capability: String,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub mode: SubmitMode,
    #[serde(default)]
    pub wait_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub code: ErrorCode,
    pub message: String,
}

/// Client-visible snapshot of a task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub capability: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskListQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskList {
    pub tasks: Vec<TaskSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_worker_request_uses_type_field() {
        let req: CreateWorkerRequest = serde_json::from_str(r#"{"type":"worker-sys"}"#).unwrap();
        assert_eq!(req.worker_type, WorkerType::WorkerSys);
    }

    #[test]
    fn test_submit_defaults() {
        let req: SubmitTaskRequest = serde_json::from_str(r#"{"capability":"echo"}"#).unwrap();
        assert_eq!(req.mode, SubmitMode::Auto);
        assert!(req.input.is_none());
        assert!(req.request_id.is_none());
    }

    #[test]
    fn test_snapshot_omits_empty_fields() {
        let snapshot = TaskSnapshot {
            task_id: TaskId::new(),
            capability: "echo".to_string(),
            status: TaskStatus::Running,
            request_id: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deadline_at: Utc::now(),
            completed_at: None,
            expires_at: None,
            status_url: None,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("result"));
        assert!(!json.contains("error"));
        assert!(!json.contains("completed_at"));
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::new("no such task");
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"error":"no such task"}"#);
    }
}
