use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::rpc::RpcStatus;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - No authentication credentials provided.
    AuthRequired,
    /// 401 - Authorization header present but carries no token.
    EmptyToken,
    /// 401 - Token failed verification.
    AuthInvalid(String),
    /// 400 - The `id` query parameter is missing.
    MissingSessionId,
    /// 400 - Malformed or invalid request.
    InvalidRequest(String),
    /// 500 - No token secret configured.
    SecretNotConfigured,
    /// 503 - No PTY capability configured.
    PtyUnavailable,
    /// 503 - The hub is shutting down.
    ShuttingDown,
    /// RPC call failed; status taken from the [`RpcStatus`].
    Rpc(RpcStatus),
}

impl From<RpcStatus> for ApiError {
    fn from(status: RpcStatus) -> Self {
        ApiError::Rpc(status)
    }
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::EmptyToken => StatusCode::UNAUTHORIZED,
            ApiError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
            ApiError::MissingSessionId => StatusCode::BAD_REQUEST,
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::SecretNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::PtyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Rpc(status) => status.status_code(),
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::EmptyToken => "empty_token",
            ApiError::AuthInvalid(_) => "auth_invalid",
            ApiError::MissingSessionId => "missing_pty_id",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::SecretNotConfigured => "secret_not_configured",
            ApiError::PtyUnavailable => "pty_unavailable",
            ApiError::ShuttingDown => "shutting_down",
            ApiError::Rpc(status) => status.code(),
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => {
                "Authentication required. Provide a token via the Authorization header.".to_string()
            }
            ApiError::EmptyToken => "Authorization header carries an empty token.".to_string(),
            ApiError::AuthInvalid(detail) => format!("Invalid authentication token: {}.", detail),
            ApiError::MissingSessionId => "Missing required query parameter 'id'.".to_string(),
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::SecretNotConfigured => "Server token secret is not configured.".to_string(),
            ApiError::PtyUnavailable => "Terminal backend is unavailable.".to_string(),
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
            ApiError::Rpc(status) => status.to_string(),
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
