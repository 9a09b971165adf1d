//! Task handlers. Bearer-authenticated, owner-scoped throughout.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use onlyboxes_protocol::http_types::{SubmitTaskRequest, TaskList, TaskListQuery};
use onlyboxes_protocol::{defaults, TaskId};

use super::{require_bearer, task_response, task_snapshot, ApiError};
use crate::bootstrap::AppState;
use crate::tasks::CancelOutcome;

pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SubmitTaskRequest>,
) -> Result<Response, ApiError> {
    let identity = require_bearer(&state, &headers).await?;
    let response = state.tasks().submit(&identity.account_id, body).await?;
    Ok(task_response(&response.row))
}

pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let identity = require_bearer(&state, &headers).await?;
    let task_id = TaskId::parse(&task_id).map_err(|_| ApiError::NotFound)?;
    let row = state
        .tasks()
        .get(&identity.account_id, &task_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    // GET always answers 200 with the snapshot; only submit/cancel use
    // the outcome-derived status mapping
    Ok(Json(task_snapshot(&row)).into_response())
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<TaskList>, ApiError> {
    let identity = require_bearer(&state, &headers).await?;
    let limit = query.limit.unwrap_or(defaults::DEFAULT_PAGE_SIZE);
    let rows = state.tasks().list(&identity.account_id, limit).await?;
    Ok(Json(TaskList {
        tasks: rows.iter().map(task_snapshot).collect(),
    }))
}

pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let identity = require_bearer(&state, &headers).await?;
    let task_id = TaskId::parse(&task_id).map_err(|_| ApiError::NotFound)?;
    match state.tasks().cancel(&identity.account_id, &task_id).await? {
        CancelOutcome::NotFound => Err(ApiError::NotFound),
        CancelOutcome::Canceled(row) => Ok(Json(task_snapshot(&row)).into_response()),
        CancelOutcome::AlreadyTerminal(row) => Ok((
            axum::http::StatusCode::CONFLICT,
            Json(task_snapshot(&row)),
        )
            .into_response()),
    }
}
