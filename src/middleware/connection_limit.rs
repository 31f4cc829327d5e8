//! Connection limit middleware for relay WebSocket connections
//!
//! Enforces a global maximum and a per-IP maximum of concurrent client sockets.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use waav_agent_relay::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/agent", get(relay_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::state::{AppState, ConnectionLimitError};

/// Client IP carried to the handler, which owns the slot once the upgrade is accepted.
#[derive(Clone, Debug)]
pub struct ClientIp(pub IpAddr);

/// Releases a connection slot on drop.
pub struct ConnectionSlot {
    state: Arc<AppState>,
    ip: IpAddr,
}

impl ConnectionSlot {
    pub fn new(state: Arc<AppState>, ip: IpAddr) -> Self {
        Self { state, ip }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.release_connection(self.ip);
        tracing::debug!(ip = %self.ip, "Released connection slot");
    }
}

/// Middleware that enforces connection limits for WebSocket upgrades.
///
/// Returns 503 when the global limit is reached and 429 when the per-IP limit
/// is reached. Non-upgrade requests pass through untouched.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return next.run(request).await;
    }

    let client_ip = addr.ip();

    match state.try_acquire_connection(client_ip) {
        Ok(()) => {
            request.extensions_mut().insert(ClientIp(client_ip));
            let response = next.run(request).await;
            // An accepted upgrade hands the slot to the handler's ConnectionSlot.
            let status = response.status();
            if status != StatusCode::SWITCHING_PROTOCOLS && !status.is_success() {
                state.release_connection(client_ip);
            }
            response
        }
        Err(ConnectionLimitError::GlobalLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting connection: global limit reached");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response()
        }
        Err(ConnectionLimitError::PerIpLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting connection: per-IP limit reached");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections from your IP address.",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::net::Ipv4Addr;

    #[test]
    fn test_slot_releases_on_drop() {
        let state = AppState::new(ServerConfig::default());
        let ip: IpAddr = Ipv4Addr::new(127, 0, 0, 2).into();

        state.try_acquire_connection(ip).unwrap();
        let slot = ConnectionSlot::new(state.clone(), ip);
        assert_eq!(state.ws_connection_count(), 1);

        drop(slot);
        assert_eq!(state.ws_connection_count(), 0);
        assert_eq!(state.ip_connection_count(&ip), 0);
    }
}
