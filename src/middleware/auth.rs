use crate::errors::auth_error::AuthError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Identity of an authenticated client, inserted into request extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    /// Id of the matching API secret; `None` when auth is disabled
    pub id: Option<String>,
}

impl Auth {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Extract authentication token from request
///
/// Supports multiple token sources for browser/WebSocket compatibility:
/// 1. Authorization header: `Authorization: Bearer <token>` (preferred)
/// 2. Query parameter: `?token=<token>` (for WebSocket connections)
fn extract_token(request: &Request) -> Result<String, AuthError> {
    if let Some(auth_header) = request.headers().get("authorization") {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| AuthError::InvalidAuthHeader)?;

        if let Some(token) = auth_str.strip_prefix("Bearer ") {
            tracing::debug!("Token extracted from Authorization header");
            return Ok(token.to_string());
        }
        return Err(AuthError::InvalidAuthHeader);
    }

    // Browsers cannot set headers on a WebSocket upgrade.
    if let Some(query) = request.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "token" {
                tracing::debug!("Token extracted from query parameter");
                return Ok(value.to_string());
            }
        }
    }

    Err(AuthError::MissingAuthHeader)
}

/// Authentication middleware that validates bearer tokens against the configured
/// API secrets.
///
/// When auth is not required an empty [`Auth`] is inserted so handlers can
/// always extract one. On success the matching secret id is inserted; otherwise
/// the request is rejected with 401 (or 400 for a malformed header).
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if !state.config.auth_required {
        tracing::debug!("Authentication disabled, inserting empty Auth context");
        request.extensions_mut().insert(Auth::empty());
        return Ok(next.run(request).await);
    }

    let request_path = request.uri().path().to_string();
    let token = extract_token(&request)?;

    match state.config.find_api_secret_id(&token) {
        Some(secret_id) => {
            tracing::info!(
                path = %request_path,
                auth_id = %secret_id,
                "API secret authentication successful"
            );
            request.extensions_mut().insert(Auth::new(secret_id));
            Ok(next.run(request).await)
        }
        None => {
            tracing::warn!(
                path = %request_path,
                "API secret authentication failed: token mismatch"
            );
            Err(AuthError::Unauthorized("Invalid API secret".to_string()))
        }
    }
}
