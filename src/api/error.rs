use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::error::BrokerError;

/// Structured error type for the HTTP handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Codes shared with the WebSocket channel use
/// the same strings as [`BrokerError::code`].
#[derive(Debug)]
pub enum ApiError {
    /// 403 - Path resolves outside the workspace.
    PathEscape(String),
    /// 404 - File does not exist.
    FileNotFound(String),
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 503 - Connection limit reached.
    TooManyConnections,
    /// 503 - Broker loop is not running.
    BrokerUnavailable,
    /// 500 - Catch-all internal error.
    InternalError(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::PathEscape(_) => StatusCode::FORBIDDEN,
            ApiError::FileNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::TooManyConnections => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BrokerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::PathEscape(_) => "path_escape",
            ApiError::FileNotFound(_) => "not_found",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::TooManyConnections => "too_many_connections",
            ApiError::BrokerUnavailable => "broker_unavailable",
            ApiError::InternalError(_) => "internal_error",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::PathEscape(path) => format!("Access denied: {}.", path),
            ApiError::FileNotFound(path) => format!("No such file: {}.", path),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::TooManyConnections => {
                "Too many connections. Try again shortly.".to_string()
            }
            ApiError::BrokerUnavailable => "Session broker is not running.".to_string(),
            ApiError::InternalError(detail) => format!("Internal error: {}.", detail),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::PathEscape(path) => ApiError::PathEscape(path),
            BrokerError::NotFound(path) => ApiError::FileNotFound(path),
            BrokerError::InvalidMessage(detail) => ApiError::InvalidRequest(detail),
            BrokerError::Unavailable => ApiError::BrokerUnavailable,
            other => ApiError::InternalError(other.to_string()),
        }
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
