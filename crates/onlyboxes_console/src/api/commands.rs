//! One-shot command handlers. Bearer-authenticated, no task rows: the
//! caller blocks on the command's waiter and gets the worker payload
//! straight back.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use onlyboxes_protocol::http_types::{
    ComputerUseRequest, EchoRequest, EchoResponse, ErrorBody, TerminalRequest,
};
use onlyboxes_protocol::{capabilities, defaults, ErrorCode};
use serde_json::{json, Value};

use super::{error_code_status, require_bearer, ApiError};
use crate::bootstrap::AppState;
use crate::dispatch::{CommandOutcome, DispatchRequest, SelectError};
use crate::registry::RouteScope;

fn check_window(timeout_ms: Option<u64>, default_ms: u64, max_ms: u64) -> Result<u64, ApiError> {
    let timeout_ms = timeout_ms.unwrap_or(default_ms);
    if !(1..=max_ms).contains(&timeout_ms) {
        return Err(ApiError::BadRequest(format!(
            "timeout_ms must be within [1, {max_ms}]"
        )));
    }
    Ok(timeout_ms)
}

fn command_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

/// Dispatch one command and wait for its terminal outcome. Returns the
/// worker's payload JSON or a ready error response. Shared with the MCP
/// echo tool.
pub(crate) async fn run_command(
    state: &AppState,
    capability: &str,
    scope: RouteScope,
    payload: Value,
    timeout_ms: u64,
) -> Result<String, Response> {
    let ticket = state
        .dispatcher()
        .dispatch(DispatchRequest {
            capability: capability.to_string(),
            scope,
            payload_json: payload.to_string(),
            deadline_at: Utc::now() + Duration::milliseconds(timeout_ms as i64),
            task_id: None,
            want_waiter: true,
        })
        .await
        .map_err(|e| match e {
            SelectError::NoWorker(_) => command_error(
                error_code_status(ErrorCode::NoWorker),
                ErrorCode::NoWorker.as_str(),
            ),
            SelectError::NoCapacity(_) => command_error(
                error_code_status(ErrorCode::NoCapacity),
                ErrorCode::NoCapacity.as_str(),
            ),
            SelectError::Store(e) => ApiError::Internal(e).into_response(),
        })?;

    let waiter = ticket
        .outcome
        .expect("command dispatch always requests a waiter here");
    // The dispatcher's own deadline timer resolves the waiter; the outer
    // timeout is a backstop against a lost signal.
    let backstop = std::time::Duration::from_millis(timeout_ms + 1_000);
    let outcome = match tokio::time::timeout(backstop, waiter).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) | Err(_) => {
            return Err(command_error(
                StatusCode::GATEWAY_TIMEOUT,
                ErrorCode::DeadlineExceeded.as_str(),
            ))
        }
    };

    match outcome {
        CommandOutcome::Succeeded { payload_json } => Ok(payload_json),
        CommandOutcome::Failed { code, message } => Err(command_error(error_code_status(code), message)),
        CommandOutcome::DeadlineExceeded => Err(command_error(
            StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::DeadlineExceeded.as_str(),
        )),
        CommandOutcome::Canceled => Err(command_error(StatusCode::CONFLICT, "command canceled")),
        CommandOutcome::WorkerLost => Err(command_error(
            error_code_status(ErrorCode::WorkerDisconnected),
            ErrorCode::WorkerDisconnected.as_str(),
        )),
        CommandOutcome::Shutdown => Err(command_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "server_shutdown",
        )),
    }
}

pub async fn echo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EchoRequest>,
) -> Result<Response, ApiError> {
    let _identity = require_bearer(&state, &headers).await?;
    let timeout_ms = check_window(
        body.timeout_ms,
        defaults::ECHO_DEFAULT_TIMEOUT_MS,
        defaults::ECHO_MAX_TIMEOUT_MS,
    )?;

    let payload = json!({ "message": body.message });
    match run_command(&state, capabilities::ECHO, RouteScope::Global, payload, timeout_ms).await {
        Ok(payload_json) => match serde_json::from_str::<EchoResponse>(&payload_json) {
            Ok(response) => Ok(Json(response).into_response()),
            Err(_) => Ok(command_error(
                StatusCode::BAD_GATEWAY,
                ErrorCode::InvalidPayload.as_str(),
            )),
        },
        Err(response) => Ok(response),
    }
}

pub async fn terminal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TerminalRequest>,
) -> Result<Response, ApiError> {
    let _identity = require_bearer(&state, &headers).await?;
    if body.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command is required".into()));
    }
    let timeout_ms = check_window(
        body.timeout_ms,
        defaults::DEFAULT_TIMEOUT_MS,
        defaults::MAX_TIMEOUT_MS,
    )?;

    let payload = json!({
        "command": body.command,
        "session_id": body.session_id,
        "create_if_missing": body.create_if_missing,
        "lease_ttl_sec": body.lease_ttl_sec,
        "request_id": body.request_id,
    });
    match run_command(
        &state,
        capabilities::TERMINAL_EXEC,
        RouteScope::Global,
        payload,
        timeout_ms,
    )
    .await
    {
        Ok(payload_json) => Ok(raw_json_response(payload_json)),
        Err(response) => Ok(response),
    }
}

/// Account-scoped to the caller's own worker-sys, which is single-flight
/// by its declared `max_inflight`.
pub async fn computer_use(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ComputerUseRequest>,
) -> Result<Response, ApiError> {
    let identity = require_bearer(&state, &headers).await?;
    let timeout_ms = check_window(
        body.timeout_ms,
        defaults::DEFAULT_TIMEOUT_MS,
        defaults::MAX_TIMEOUT_MS,
    )?;

    match run_command(
        &state,
        capabilities::COMPUTER_USE,
        RouteScope::AccountScoped(identity.account_id),
        body.input,
        timeout_ms,
    )
    .await
    {
        Ok(payload_json) => Ok(raw_json_response(payload_json)),
        Err(response) => Ok(response),
    }
}

/// Pass a worker payload through as-is, with a JSON fallback when the
/// worker sent something unparsable.
fn raw_json_response(payload_json: String) -> Response {
    match serde_json::from_str::<Value>(&payload_json) {
        Ok(value) => Json(value).into_response(),
        Err(_) => command_error(StatusCode::BAD_GATEWAY, ErrorCode::InvalidPayload.as_str()),
    }
}
