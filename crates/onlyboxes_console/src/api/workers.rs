//! Worker fleet handlers. Cookie-authenticated.
//!
//! Non-admin accounts see exactly one worker (their own worker-sys) in
//! every view here; everything else reads as absent.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use onlyboxes_db::WorkerNodeRow;
use onlyboxes_protocol::http_types::{
    CreateWorkerRequest, InflightSnapshot, WorkerListQuery, WorkerPage, WorkerStats,
    WorkerStatsQuery, WorkerStatusFilter,
};
use onlyboxes_protocol::{defaults, NodeId};

use super::{require_dashboard, ApiError};
use crate::auth::Identity;
use crate::bootstrap::AppState;

/// The one node a non-admin may see: their claimed worker-sys.
async fn own_worker_sys(
    state: &AppState,
    identity: &Identity,
) -> Result<Option<WorkerNodeRow>, ApiError> {
    let Some(claim) = state
        .db()
        .workers()
        .get_owner_claim(&identity.account_id)
        .await?
    else {
        return Ok(None);
    };
    let node_id = NodeId::parse(&claim.node_id)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("corrupt claim node id: {e}")))?;
    Ok(state.db().workers().get(&node_id).await?)
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WorkerListQuery>,
) -> Result<Json<WorkerPage>, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(defaults::DEFAULT_PAGE_SIZE)
        .clamp(1, defaults::MAX_PAGE_SIZE);
    let online_filter = match query.status.unwrap_or_default() {
        WorkerStatusFilter::All => None,
        WorkerStatusFilter::Online => Some(true),
        WorkerStatusFilter::Offline => Some(false),
    };
    let now = Utc::now();
    let cutoff = now - state.config().offline_ttl;

    let (rows, total) = if identity.is_admin {
        state
            .db()
            .workers()
            .list_page(page, page_size, online_filter, cutoff)
            .await?
    } else {
        let row = own_worker_sys(&state, &identity).await?;
        let rows: Vec<WorkerNodeRow> = row
            .into_iter()
            .filter(|row| match online_filter {
                None => true,
                Some(true) => row.is_online(now, state.config().offline_ttl),
                Some(false) => !row.is_online(now, state.config().offline_ttl),
            })
            .collect();
        let total = rows.len() as u64;
        (if page == 1 { rows } else { Vec::new() }, total)
    };

    let mut workers = Vec::with_capacity(rows.len());
    for row in &rows {
        workers.push(
            state
                .registry()
                .worker_info(row, now, state.config().stale_after)
                .await?,
        );
    }
    Ok(Json(WorkerPage {
        workers,
        page,
        page_size,
        total,
    }))
}

pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<WorkerStatsQuery>,
) -> Result<Json<WorkerStats>, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let now = Utc::now();
    let stale_after = query
        .stale_after_sec
        .map(|secs| Duration::seconds(secs as i64))
        .unwrap_or(state.config().stale_after);
    let offline_cutoff = now - state.config().offline_ttl;
    let stale_cutoff = now - stale_after;

    let (total, online, stale) = if identity.is_admin {
        state.db().workers().stats(offline_cutoff, stale_cutoff).await?
    } else {
        match own_worker_sys(&state, &identity).await? {
            None => (0, 0, 0),
            Some(row) => {
                let online = row.is_online(now, state.config().offline_ttl);
                let stale = online && row.is_stale(now, stale_after);
                (1, online as u64, stale as u64)
            }
        }
    };
    Ok(Json(WorkerStats {
        total,
        online,
        offline: total - online,
        stale,
    }))
}

pub async fn inflight(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<InflightSnapshot>, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let mut entries = state.inflight().snapshot();

    if !identity.is_admin {
        let own = own_worker_sys(&state, &identity).await?;
        let own_id = own.map(|row| row.node_id);
        entries.retain(|entry| Some(entry.node_id.as_str()) == own_id.as_deref());
    }

    // Fill in each entry's declared cap for the dashboard
    for entry in &mut entries {
        if let Some(max) = state
            .db()
            .workers()
            .capabilities_for(&entry.node_id)
            .await?
            .into_iter()
            .find(|cap| cap.name_key == entry.capability)
        {
            entry.max_inflight = max.max_inflight.max(0) as u32;
        }
    }
    Ok(Json(InflightSnapshot { entries }))
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateWorkerRequest>,
) -> Result<Response, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let created = state
        .provisioner()
        .create_worker(&identity, body.worker_type)
        .await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(node_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let node_id = NodeId::parse(&node_id).map_err(|_| ApiError::NotFound)?;
    state.provisioner().delete_worker(&identity, &node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
