//! Relay WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::relay::relay_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the relay WebSocket router
///
/// # Endpoint
///
/// `GET {path}` - WebSocket upgrade for the voice-agent protocol
///
/// # Protocol
///
/// After the upgrade the client sends `Settings`, then audio and content
/// messages; the relay answers with `Welcome`, `SettingsApplied` once upstream
/// has applied the configuration, and the agent's events and audio.
///
/// # Authentication
///
/// Uses the shared auth middleware; browsers may pass `?token=`.
pub fn create_relay_router(path: &str) -> Router<Arc<AppState>> {
    Router::new()
        .route(path, get(relay_handler))
        .layer(TraceLayer::new_for_http())
}
