//! HTTP error mapping. Everything renders as `{"error": "..."}` with
//! minimal detail; cross-owner misses are always plain 404s.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use onlyboxes_protocol::http_types::ErrorBody;
use onlyboxes_protocol::ErrorCode;
use tracing::error;

use crate::auth::AuthError;
use crate::provision::ProvisionError;
use crate::tasks::SubmitError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict(String),
    Gone,
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "authentication required".into()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "not authorized".into()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".into()),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::Gone => (StatusCode::GONE, "this endpoint has been removed".into()),
            ApiError::Internal(e) => {
                error!(error = %e, "Internal error serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".into())
            }
        };
        (status, Json(ErrorBody::new(message))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        ApiError::Internal(value)
    }
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match value {
            AuthError::InvalidCredentials => ApiError::BadRequest("invalid credentials".into()),
            AuthError::Forbidden => ApiError::Forbidden,
            AuthError::NotFound => ApiError::NotFound,
            AuthError::Conflict(message) => ApiError::Conflict(message),
            AuthError::Store(e) => ApiError::Internal(e),
        }
    }
}

impl From<ProvisionError> for ApiError {
    fn from(value: ProvisionError) -> Self {
        match value {
            ProvisionError::Forbidden => ApiError::Forbidden,
            ProvisionError::AlreadyClaimed => {
                ApiError::Conflict("account already owns a worker-sys".into())
            }
            ProvisionError::NotFound => ApiError::NotFound,
            ProvisionError::Store(e) => ApiError::Internal(e),
        }
    }
}

impl From<SubmitError> for ApiError {
    fn from(value: SubmitError) -> Self {
        match value {
            SubmitError::InvalidRequest(message) => ApiError::BadRequest(message),
            SubmitError::RequestIdInProgress => {
                ApiError::Conflict(ErrorCode::RequestIdInProgress.as_str().into())
            }
            SubmitError::Store(e) => ApiError::Internal(e),
        }
    }
}

/// HTTP status for a task error code, shared by the commands and tasks
/// surfaces.
pub fn error_code_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NoWorker => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::NoCapacity => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorCode::SessionBusy => StatusCode::CONFLICT,
        ErrorCode::InvalidPayload => StatusCode::BAD_REQUEST,
        ErrorCode::RequestIdInProgress => StatusCode::CONFLICT,
        ErrorCode::WorkerDisconnected
        | ErrorCode::ExecutionFailed
        | ErrorCode::ConsoleRestarted => StatusCode::BAD_GATEWAY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_codes_map_to_retryable_statuses() {
        assert_eq!(error_code_status(ErrorCode::NoWorker), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code_status(ErrorCode::NoCapacity), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            error_code_status(ErrorCode::DeadlineExceeded),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            error_code_status(ErrorCode::ExecutionFailed),
            StatusCode::BAD_GATEWAY
        );
    }
}
