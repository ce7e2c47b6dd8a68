use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::gateway::GatewayClosed;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 403 - WebSocket upgrade from an origin outside the allow-list.
    OriginNotAllowed,
    /// 404 - A specific session id was not found.
    SessionNotFound(String),
    /// 503 - The gateway worker has stopped (server shutting down).
    GatewayUnavailable,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::GatewayUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::GatewayUnavailable => "gateway_unavailable",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::OriginNotAllowed => "Origin not allowed.".to_string(),
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::GatewayUnavailable => "Server is shutting down.".to_string(),
        }
    }
}

impl From<GatewayClosed> for ApiError {
    fn from(_: GatewayClosed) -> Self {
        ApiError::GatewayUnavailable
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
