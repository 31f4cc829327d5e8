pub mod api;
pub mod relay;

use axum::{Router, middleware};
use http::{
    Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use crate::middleware::{auth_middleware, connection_limit_middleware};
use crate::state::AppState;

/// Assemble the relay application.
///
/// Layer order on the relay route (outer to inner): connection_limit -> auth -> handler.
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`; the connection
/// limit reads the peer address.
pub fn create_app(state: Arc<AppState>) -> Router {
    let relay_routes = relay::create_relay_router(&state.config.relay_path)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            connection_limit_middleware,
        ));

    let cors_layer = cors_layer(state.config.cors_allowed_origins.as_deref());

    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            http::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            http::HeaderValue::from_static("DENY"),
        ));

    api::create_public_router()
        .merge(relay_routes)
        .with_state(state)
        .layer(cors_layer)
        .layer(security_headers)
}

fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    match origins {
        Some("*") => base.allow_origin(Any).allow_credentials(false),
        Some(origins) => {
            let origins: Vec<http::HeaderValue> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            base.allow_origin(origins).allow_credentials(true)
        }
        None => {
            info!(
                "CORS not configured, defaulting to same-origin only. \
                 Set CORS_ALLOWED_ORIGINS to enable cross-origin access."
            );
            base.allow_credentials(false)
        }
    }
}
