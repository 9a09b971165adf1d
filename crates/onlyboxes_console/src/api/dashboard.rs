//! Dashboard handlers: sessions, accounts, tokens. Cookie-authenticated.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use onlyboxes_db::AccountRow;
use onlyboxes_protocol::http_types::{
    AccountInfo, AccountPage, ChangePasswordRequest, CreateTokenRequest, CreateTokenResponse,
    LoginRequest, RegisterAccountRequest, SessionInfo, TokenInfo,
};
use onlyboxes_protocol::{defaults, AccountId, TokenId};
use serde::Deserialize;

use super::{cookie_value, require_dashboard, ApiError, SESSION_COOKIE};
use crate::bootstrap::AppState;

fn account_info(row: &AccountRow) -> Result<AccountInfo, ApiError> {
    let account_id = AccountId::parse(&row.account_id)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("corrupt account id: {e}")))?;
    Ok(AccountInfo {
        account_id,
        username: row.username.clone(),
        is_admin: row.is_admin,
        created_at: row.created_at,
    })
}

fn token_info(row: &onlyboxes_db::TokenRow) -> Result<TokenInfo, ApiError> {
    let token_id = TokenId::parse(&row.token_id)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("corrupt token id: {e}")))?;
    Ok(TokenInfo {
        token_id,
        name: row.name.clone(),
        masked: row.token_suffix.clone(),
        created_at: row.created_at,
    })
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let (cookie, account) = state.auth().login(&body.username, &body.password).await?;
    let session_ttl_secs = state.config().session_ttl.num_seconds();
    let set_cookie = format!(
        "{SESSION_COOKIE}={cookie}; Path=/; HttpOnly; SameSite=Lax; Max-Age={session_ttl_secs}"
    );
    let body = SessionInfo {
        account: account_info(&account)?,
    };
    Ok(([(header::SET_COOKIE, set_cookie)], Json(body)).into_response())
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(cookie) = cookie_value(&headers) {
        state.auth().logout(&cookie);
    }
    let clear = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; Max-Age=0");
    (StatusCode::NO_CONTENT, [(header::SET_COOKIE, clear)]).into_response()
}

pub async fn session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionInfo>, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let account = state
        .db()
        .accounts()
        .get(&identity.account_id)
        .await?
        .ok_or(ApiError::Unauthorized)?;
    Ok(Json(SessionInfo {
        account: account_info(&account)?,
    }))
}

pub async fn change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChangePasswordRequest>,
) -> Result<StatusCode, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    if body.new_password.len() < 8 {
        return Err(ApiError::BadRequest(
            "new password must be at least 8 characters".into(),
        ));
    }
    state
        .auth()
        .change_password(&identity.account_id, &body.current_password, &body.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterAccountRequest>,
) -> Result<Response, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let account = state
        .auth()
        .register_account(&identity, &body.username, &body.password, body.is_admin)
        .await?;
    Ok((StatusCode::CREATED, Json(account_info(&account)?)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub page_size: Option<u32>,
}

pub async fn list_accounts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Result<Json<AccountPage>, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query
        .page_size
        .unwrap_or(defaults::DEFAULT_PAGE_SIZE)
        .clamp(1, defaults::MAX_PAGE_SIZE);
    let (rows, total) = state.auth().list_accounts(&identity, page, page_size).await?;
    let accounts = rows
        .iter()
        .map(account_info)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(AccountPage {
        accounts,
        page,
        page_size,
        total,
    }))
}

pub async fn delete_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(account_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let target = AccountId::parse(&account_id).map_err(|_| ApiError::NotFound)?;
    state.auth().delete_account(&identity, &target).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<TokenInfo>>, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let rows = state.auth().list_tokens(&identity).await?;
    let tokens = rows.iter().map(token_info).collect::<Result<Vec<_>, _>>()?;
    Ok(Json(tokens))
}

pub async fn create_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTokenRequest>,
) -> Result<Response, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let (row, plaintext) = state.auth().create_token(&identity, &body.name).await?;
    let token_id = TokenId::parse(&row.token_id)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("corrupt token id: {e}")))?;
    // The only response that ever carries the plaintext
    let body = CreateTokenResponse {
        token_id,
        name: row.name,
        token: plaintext,
        masked: row.token_suffix,
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

pub async fn delete_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let identity = require_dashboard(&state, &headers).await?;
    let token_id = TokenId::parse(&token_id).map_err(|_| ApiError::NotFound)?;
    if !state.auth().delete_token(&identity, &token_id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}
