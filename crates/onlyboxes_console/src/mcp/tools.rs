//! MCP tool registry: schemas and execution.
//!
//! Argument structs use `deny_unknown_fields`, mirroring the
//! `additionalProperties: false` schemas: an unknown argument is a
//! protocol-level -32602, never a silent drop.

use onlyboxes_protocol::http_types::SubmitTaskRequest;
use onlyboxes_protocol::{capabilities, defaults, SubmitMode, TaskId};
use serde::Deserialize;
use serde_json::{json, Value};

use super::protocol::{Tool, ToolCallResult};
use crate::auth::Identity;
use crate::bootstrap::AppState;
use crate::registry::RouteScope;
use crate::tasks::{CancelOutcome, SubmitError};

pub fn tool_list() -> Vec<Tool> {
    vec![
        Tool {
            name: "submit_task".into(),
            description: "Submit a task for execution on the worker fleet. Returns the task snapshot; poll get_task for async completions.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "capability": { "type": "string", "description": "Capability to run, e.g. pythonExec" },
                    "input": { "type": "object", "description": "Opaque payload for the worker" },
                    "mode": { "type": "string", "enum": ["sync", "async", "auto"] },
                    "wait_ms": { "type": "integer", "minimum": 1, "maximum": defaults::MAX_WAIT_MS },
                    "timeout_ms": { "type": "integer", "minimum": 1, "maximum": defaults::MAX_TIMEOUT_MS },
                    "request_id": { "type": "string", "description": "Idempotency key" }
                },
                "required": ["capability"],
                "additionalProperties": false
            }),
        },
        Tool {
            name: "get_task".into(),
            description: "Fetch the current snapshot of one of your tasks.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" }
                },
                "required": ["task_id"],
                "additionalProperties": false
            }),
        },
        Tool {
            name: "cancel_task".into(),
            description: "Best-effort cancellation of a running task.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" }
                },
                "required": ["task_id"],
                "additionalProperties": false
            }),
        },
        Tool {
            name: "echo".into(),
            description: "Round-trip a message through an online worker.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string" },
                    "timeout_ms": { "type": "integer", "minimum": 1, "maximum": defaults::ECHO_MAX_TIMEOUT_MS }
                },
                "required": ["message"],
                "additionalProperties": false
            }),
        },
    ]
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubmitTaskArgs {
    capability: String,
    #[serde(default)]
    input: Option<Value>,
    #[serde(default)]
    mode: Option<SubmitMode>,
    #[serde(default)]
    wait_ms: Option<u64>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskIdArgs {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EchoArgs {
    message: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Tool dispatch outcomes the JSON-RPC layer must distinguish.
pub enum ToolError {
    /// Unknown tool name
    UnknownTool(String),
    /// Arguments failed schema validation (-32602)
    InvalidArguments(String),
    /// Store or dispatch plumbing failed (-32603)
    Internal(String),
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Option<Value>) -> Result<T, ToolError> {
    let value = arguments.unwrap_or_else(|| json!({}));
    serde_json::from_value(value).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

pub async fn call_tool(
    state: &AppState,
    identity: &Identity,
    name: &str,
    arguments: Option<Value>,
) -> Result<ToolCallResult, ToolError> {
    match name {
        "submit_task" => {
            let args: SubmitTaskArgs = parse_args(arguments)?;
            let request = SubmitTaskRequest {
                capability: args.capability,
                input: args.input,
                mode: args.mode.unwrap_or_default(),
                wait_ms: args.wait_ms,
                timeout_ms: args.timeout_ms,
                request_id: args.request_id,
            };
            match state.tasks().submit(&identity.account_id, request).await {
                Ok(response) => Ok(snapshot_result(&response.row)),
                Err(SubmitError::InvalidRequest(message)) => {
                    Err(ToolError::InvalidArguments(message))
                }
                Err(SubmitError::RequestIdInProgress) => {
                    Ok(ToolCallResult::error("request_id_in_progress"))
                }
                Err(SubmitError::Store(e)) => Err(ToolError::Internal(e.to_string())),
            }
        }
        "get_task" => {
            let args: TaskIdArgs = parse_args(arguments)?;
            let Ok(task_id) = TaskId::parse(&args.task_id) else {
                return Ok(ToolCallResult::error("task not found"));
            };
            match state.tasks().get(&identity.account_id, &task_id).await {
                Ok(Some(row)) => Ok(snapshot_result(&row)),
                Ok(None) => Ok(ToolCallResult::error("task not found")),
                Err(e) => Err(ToolError::Internal(e.to_string())),
            }
        }
        "cancel_task" => {
            let args: TaskIdArgs = parse_args(arguments)?;
            let Ok(task_id) = TaskId::parse(&args.task_id) else {
                return Ok(ToolCallResult::error("task not found"));
            };
            match state.tasks().cancel(&identity.account_id, &task_id).await {
                Ok(CancelOutcome::NotFound) => Ok(ToolCallResult::error("task not found")),
                Ok(CancelOutcome::Canceled(row)) => Ok(snapshot_result(&row)),
                Ok(CancelOutcome::AlreadyTerminal(row)) => Ok(snapshot_result(&row)),
                Err(e) => Err(ToolError::Internal(e.to_string())),
            }
        }
        "echo" => {
            let args: EchoArgs = parse_args(arguments)?;
            let timeout_ms = args.timeout_ms.unwrap_or(defaults::ECHO_DEFAULT_TIMEOUT_MS);
            if !(1..=defaults::ECHO_MAX_TIMEOUT_MS).contains(&timeout_ms) {
                return Err(ToolError::InvalidArguments(format!(
                    "timeout_ms must be within [1, {}]",
                    defaults::ECHO_MAX_TIMEOUT_MS
                )));
            }
            let payload = json!({ "message": args.message });
            match crate::api::commands::run_command(
                state,
                capabilities::ECHO,
                RouteScope::Global,
                payload,
                timeout_ms,
            )
            .await
            {
                Ok(payload_json) => Ok(ToolCallResult::text(payload_json)),
                Err(_) => Ok(ToolCallResult::error("echo failed")),
            }
        }
        other => Err(ToolError::UnknownTool(other.to_string())),
    }
}

fn snapshot_result(row: &onlyboxes_db::TaskRow) -> ToolCallResult {
    let snapshot = crate::api::task_snapshot(row);
    match serde_json::to_string(&snapshot) {
        Ok(text) => ToolCallResult::text(text),
        Err(e) => ToolCallResult::error(format!("snapshot serialization failed: {e}")),
    }
}
