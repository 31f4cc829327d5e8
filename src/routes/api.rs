use axum::{Router, routing::get};

use crate::handlers::api::health_check;
use crate::state::AppState;
use std::sync::Arc;

/// Public routes (no auth)
pub fn create_public_router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(health_check))
}
