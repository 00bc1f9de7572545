//! Shared API types and error mapping.
//!
//! Every failure response carries the same `{error, message}` shape with a
//! stable kind identifier. Business failures map to 4xx, infrastructure
//! failures to 5xx; messages never include tokens or connection strings.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use reputation_core::ReputationError;
use serde::Serialize;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// API error envelope.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed request input (path, query, or body semantics)
    BadRequest(String),
    /// Missing or wrong webhook credential
    Unauthorized(String),
    /// Resource does not exist
    NotFound(String),
    /// Storage failed while the batch was being processed
    StorageUnavailable(String),
    /// Anything surfaced by the engine
    Engine(ReputationError),
}

impl From<ReputationError> for ApiError {
    fn from(err: ReputationError) -> Self {
        ApiError::Engine(err)
    }
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::StorageUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable")
            }
            ApiError::Engine(err) => {
                let status = match err {
                    ReputationError::InvalidInput(_) => StatusCode::BAD_REQUEST,
                    ReputationError::NotFound(_) => StatusCode::NOT_FOUND,
                    ReputationError::QuotaExceeded { .. } => StatusCode::CONFLICT,
                    ReputationError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
                    ReputationError::Upstream(_) => StatusCode::BAD_GATEWAY,
                    ReputationError::UpstreamRateLimited => StatusCode::SERVICE_UNAVAILABLE,
                    ReputationError::ProbeTimeout => StatusCode::GATEWAY_TIMEOUT,
                    ReputationError::Cancelled | ReputationError::Internal(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.kind())
            }
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::NotFound(msg)
            | ApiError::StorageUnavailable(msg) => msg.clone(),
            ApiError::Engine(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        let body = ErrorResponse {
            error: kind.to_string(),
            message: self.message(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_map_to_expected_status() {
        let cases = [
            (
                ApiError::Engine(ReputationError::InvalidInput("x".into())),
                StatusCode::BAD_REQUEST,
                "invalid_input",
            ),
            (
                ApiError::Engine(ReputationError::NotFound("x".into())),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                ApiError::Engine(ReputationError::QuotaExceeded {
                    requested: 3,
                    remaining: 1,
                }),
                StatusCode::CONFLICT,
                "quota_exceeded",
            ),
            (
                ApiError::Engine(ReputationError::Upstream("boom".into())),
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
            ),
            (
                ApiError::Engine(ReputationError::ProbeTimeout),
                StatusCode::GATEWAY_TIMEOUT,
                "probe_timeout",
            ),
            (
                ApiError::Unauthorized("missing bearer token".into()),
                StatusCode::UNAUTHORIZED,
                "unauthorized",
            ),
            (
                ApiError::StorageUnavailable("insert failed".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
            ),
        ];

        for (error, expected_status, expected_kind) in cases {
            let (status, kind) = error.status_and_kind();
            assert_eq!(status, expected_status);
            assert_eq!(kind, expected_kind);
        }
    }
}
