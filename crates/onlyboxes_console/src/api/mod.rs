//! REST + MCP surface (`/api/v1`, `/mcp`).

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use onlyboxes_db::TaskRow;
use onlyboxes_protocol::http_types::TaskSnapshot;
use onlyboxes_protocol::TaskStatus;
use tower_http::trace::TraceLayer;

use crate::auth::Identity;
use crate::bootstrap::AppState;

pub mod commands;
pub mod dashboard;
pub mod error;
pub mod tasks;
pub mod workers;

pub use error::{error_code_status, ApiError};

/// Dashboard session cookie name.
pub const SESSION_COOKIE: &str = "obx_session";

pub fn router(state: AppState) -> Router {
    Router::new()
        // Dashboard (cookie)
        .route("/api/v1/dashboard/login", post(dashboard::login))
        .route("/api/v1/dashboard/logout", post(dashboard::logout))
        .route("/api/v1/dashboard/session", get(dashboard::session))
        .route("/api/v1/dashboard/password", post(dashboard::change_password))
        .route("/api/v1/dashboard/register", post(dashboard::register))
        .route("/api/v1/dashboard/accounts", get(dashboard::list_accounts))
        .route(
            "/api/v1/dashboard/accounts/:account_id",
            delete(dashboard::delete_account),
        )
        .route(
            "/api/v1/dashboard/tokens",
            get(dashboard::list_tokens).post(dashboard::create_token),
        )
        .route(
            "/api/v1/dashboard/tokens/:token_id",
            delete(dashboard::delete_token),
        )
        .route("/api/v1/dashboard/token/value", get(gone))
        // Workers (cookie)
        .route(
            "/api/v1/workers",
            get(workers::list).post(workers::create),
        )
        .route("/api/v1/workers/stats", get(workers::stats))
        .route("/api/v1/workers/inflight", get(workers::inflight))
        .route("/api/v1/workers/:node_id", delete(workers::remove))
        .route("/api/v1/workers/:node_id/startup-command", get(gone))
        // Commands (bearer)
        .route("/api/v1/commands/echo", post(commands::echo))
        .route("/api/v1/commands/terminal", post(commands::terminal))
        .route("/api/v1/commands/computer-use", post(commands::computer_use))
        // Tasks (bearer)
        .route("/api/v1/tasks", post(tasks::submit).get(tasks::list))
        .route("/api/v1/tasks/:task_id", get(tasks::get))
        .route("/api/v1/tasks/:task_id/cancel", post(tasks::cancel))
        // MCP (bearer)
        .route("/mcp", post(crate::mcp::handle_post).get(mcp_method_not_allowed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn gone() -> ApiError {
    ApiError::Gone
}

async fn mcp_method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        Json(onlyboxes_protocol::http_types::ErrorBody::new(
            "use POST for MCP requests",
        )),
    )
        .into_response()
}

// ============================================================================
// Auth extraction helpers
// ============================================================================

pub(crate) fn cookie_value(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

pub(crate) fn bearer_value(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(|value| value.trim().to_string())
}

/// Resolve the dashboard cookie or fail with 401.
pub(crate) async fn require_dashboard(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, ApiError> {
    let cookie = cookie_value(headers).ok_or(ApiError::Unauthorized)?;
    state
        .auth()
        .resolve_cookie(&cookie)
        .await?
        .ok_or(ApiError::Unauthorized)
}

/// Resolve the bearer token or fail with 401.
pub(crate) async fn require_bearer(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Identity, ApiError> {
    let token = bearer_value(headers).ok_or(ApiError::Unauthorized)?;
    state
        .auth()
        .resolve_bearer(&token)
        .await?
        .ok_or(ApiError::Unauthorized)
}

// ============================================================================
// Task response rendering
// ============================================================================

pub(crate) fn task_snapshot(row: &TaskRow) -> TaskSnapshot {
    let mut snapshot = row.to_snapshot();
    if snapshot.status == TaskStatus::Running {
        snapshot.status_url = Some(format!("/api/v1/tasks/{}", row.task_id));
    }
    snapshot
}

/// Render a task row with its outcome status: 200 succeeded, 202
/// running, 409 canceled, and capacity/deadline codes for failures.
pub(crate) fn task_response(row: &TaskRow) -> Response {
    let snapshot = task_snapshot(row);
    let status = match row.status() {
        TaskStatus::Running => StatusCode::ACCEPTED,
        TaskStatus::Succeeded => StatusCode::OK,
        TaskStatus::Canceled => StatusCode::CONFLICT,
        TaskStatus::Failed => row
            .error_code
            .as_deref()
            .and_then(|code| code.parse().ok())
            .map(error_code_status)
            .unwrap_or(StatusCode::BAD_GATEWAY),
    };
    (status, Json(snapshot)).into_response()
}
