//! Authentication errors for the relay's HTTP surface.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors raised while authenticating an inbound client connection.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authentication token")]
    MissingAuthHeader,

    #[error("Invalid Authorization header format")]
    InvalidAuthHeader,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

impl AuthError {
    fn code(&self) -> &'static str {
        match self {
            AuthError::MissingAuthHeader => "missing_auth_header",
            AuthError::InvalidAuthHeader => "invalid_auth_header",
            AuthError::Unauthorized(_) => "unauthorized",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::InvalidAuthHeader => StatusCode::BAD_REQUEST,
            AuthError::MissingAuthHeader | AuthError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        };

        tracing::warn!(error = %self, "Rejecting unauthenticated request");

        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}
