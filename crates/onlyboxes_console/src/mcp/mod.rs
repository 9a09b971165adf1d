//! Stateless MCP endpoint: one JSON-RPC request per `POST /mcp`.
//!
//! Bearer auth happens at the HTTP layer (401 before any JSON-RPC
//! processing); JSON-RPC errors cover everything after that. `GET /mcp`
//! is answered with 405 by the router.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use crate::api::{require_bearer, ApiError};
use crate::bootstrap::AppState;

pub mod protocol;
pub mod tools;

use protocol::{
    ErrorCode, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId,
    ServerCapabilities, ServerInfo, ToolCallParams, ToolsCapability, ToolsListResult,
    JSONRPC_VERSION, MCP_PROTOCOL_VERSION,
};
use tools::ToolError;

pub async fn handle_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Response, ApiError> {
    let identity = require_bearer(&state, &headers).await?;

    let request: JsonRpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => {
            let response = JsonRpcResponse::error(
                None,
                JsonRpcError::new(ErrorCode::ParseError, format!("invalid JSON-RPC body: {e}")),
            );
            return Ok(Json(response).into_response());
        }
    };
    if request.jsonrpc != JSONRPC_VERSION {
        let response = JsonRpcResponse::error(
            request.id,
            JsonRpcError::new(ErrorCode::InvalidRequest, "jsonrpc must be \"2.0\""),
        );
        return Ok(Json(response).into_response());
    }

    // Notifications get an empty 202, no JSON-RPC response
    if request.id.is_none() {
        debug!(method = %request.method, "MCP notification acknowledged");
        return Ok(StatusCode::ACCEPTED.into_response());
    }

    let id = request.id.clone();
    let response = dispatch_method(&state, &identity, request, id).await;
    Ok(Json(response).into_response())
}

async fn dispatch_method(
    state: &AppState,
    identity: &crate::auth::Identity,
    request: JsonRpcRequest,
    id: Option<RequestId>,
) -> JsonRpcResponse {
    match request.method.as_str() {
        "initialize" => {
            let result = InitializeResult {
                protocol_version: MCP_PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities {
                    tools: ToolsCapability {
                        list_changed: false,
                    },
                },
                server_info: ServerInfo {
                    name: "onlyboxes-console".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            };
            success(id, &result)
        }
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => success(
            id,
            &ToolsListResult {
                tools: tools::tool_list(),
            },
        ),
        "tools/call" => {
            let params: ToolCallParams = match request
                .params
                .ok_or_else(|| "params are required".to_string())
                .and_then(|params| {
                    serde_json::from_value(params).map_err(|e| e.to_string())
                }) {
                Ok(params) => params,
                Err(message) => {
                    return JsonRpcResponse::error(
                        id,
                        JsonRpcError::new(ErrorCode::InvalidParams, message),
                    )
                }
            };
            match tools::call_tool(state, identity, &params.name, params.arguments).await {
                Ok(result) => success(id, &result),
                Err(ToolError::UnknownTool(name)) => JsonRpcResponse::error(
                    id,
                    JsonRpcError::new(ErrorCode::MethodNotFound, format!("unknown tool '{name}'")),
                ),
                Err(ToolError::InvalidArguments(message)) => JsonRpcResponse::error(
                    id,
                    JsonRpcError::new(ErrorCode::InvalidParams, message),
                ),
                Err(ToolError::Internal(message)) => JsonRpcResponse::error(
                    id,
                    JsonRpcError::new(ErrorCode::InternalError, message),
                ),
            }
        }
        other => JsonRpcResponse::error(
            id,
            JsonRpcError::new(ErrorCode::MethodNotFound, format!("unknown method '{other}'")),
        ),
    }
}

fn success<T: serde::Serialize>(id: Option<RequestId>, result: &T) -> JsonRpcResponse {
    match serde_json::to_value(result) {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error(
            id,
            JsonRpcError::new(ErrorCode::InternalError, format!("serialization failed: {e}")),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_schemas_are_strict() {
        for tool in tools::tool_list() {
            let schema = tool.input_schema;
            assert_eq!(
                schema.get("additionalProperties"),
                Some(&Value::Bool(false)),
                "tool {} must reject unknown arguments",
                tool.name
            );
            assert!(schema.get("properties").is_some());
        }
    }
}
