//! Relay WebSocket handler
//!
//! Each client socket gets its own upstream socket and [`ProtocolBridge`]. One task
//! owns the bridge and multiplexes both read halves; each socket has a single
//! writer task fed by an [`OutboundRouter`]. The upstream router buffers until
//! the upstream socket opens, so client frames arriving during the dial keep
//! their order.

use axum::{
    Extension,
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::StreamExt;
use futures::stream::SplitStream;
use std::sync::Arc;
use tokio::select;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::{self, Message as UpstreamMessage};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::core::bridge::{BridgeAction, ProtocolBridge};
use crate::core::router::{OutboundFrame, OutboundRouter, SendOutcome, drive_writer};
use crate::core::transport::{WsStream, connect_websocket, to_ws_message};
use crate::middleware::{Auth, ClientIp, ConnectionSlot};
use crate::state::AppState;

/// Maximum WebSocket frame size (10 MB)
const MAX_WS_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Maximum WebSocket message size (10 MB)
const MAX_WS_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to let the client writer flush its close frame.
const CLIENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Relay WebSocket handler
///
/// Upgrades the client connection and relays it to the configured upstream
/// realtime service.
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<Auth>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    info!(auth_id = ?auth.id, "Relay WebSocket connection upgrade requested");

    let slot = client_ip.map(|Extension(ClientIp(ip))| ConnectionSlot::new(state.clone(), ip));

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let _slot = slot;
            let connection_id = uuid::Uuid::new_v4().to_string();
            let span = info_span!("relay", %connection_id, auth_id = ?auth.id);
            handle_relay_socket(socket, state).instrument(span).await
        })
}

/// Run one client/upstream pair until either side closes.
async fn handle_relay_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Relay WebSocket connection established");

    let (client_sink, mut client_stream) = socket.split();
    let (client, client_rx) = OutboundRouter::new(false);
    client.mark_open();
    let client_writer = tokio::spawn(drive_writer(
        client_sink,
        client_rx,
        client.clone(),
        to_client_message,
    ));

    let (upstream, upstream_rx) = OutboundRouter::new(true);
    let mut upstream_rx = Some(upstream_rx);
    let mut upstream_stream: Option<SplitStream<WsStream>> = None;

    let endpoint = state
        .config
        .upstream_endpoint()
        .unwrap_or_else(|_| state.config.upstream_url.clone());
    let headers = state.config.upstream_connect_headers();
    let connect = connect_websocket(&endpoint, &headers, UPSTREAM_CONNECT_TIMEOUT);
    tokio::pin!(connect);
    let mut connecting = true;

    let mut bridge = ProtocolBridge::new(state.bridge_options());
    let settings_timeout = Duration::from_millis(state.config.settings_timeout_ms);
    let mut settings_deadline: Option<Instant> = None;
    let mut settings_timer_armed = false;

    loop {
        let actions = select! {
            result = &mut connect, if connecting => {
                connecting = false;
                match result {
                    Ok(ws) => {
                        let (sink, stream) = ws.split();
                        if let Some(rx) = upstream_rx.take() {
                            tokio::spawn(drive_writer(sink, rx, upstream.clone(), to_ws_message));
                        }
                        let buffered = upstream.backlog_len();
                        upstream.mark_open();
                        upstream_stream = Some(stream);
                        info!(buffered, "Connected to upstream");
                        Vec::new()
                    }
                    Err(e) => {
                        error!("Upstream connection failed: {}", e);
                        bridge.upstream_closed(None, &e.to_string())
                    }
                }
            }

            msg = client_stream.next() => match msg {
                Some(Ok(Message::Text(text))) => bridge.handle_client_text(text.as_str()),
                Some(Ok(Message::Binary(data))) => bridge.handle_client_binary(data),
                Some(Ok(Message::Close(frame))) => {
                    info!(code = ?frame.as_ref().map(|f| f.code), "Client closed connection");
                    break;
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(e)) => {
                    warn!("Client WebSocket error: {}", e);
                    break;
                }
                None => {
                    info!("Client connection ended");
                    break;
                }
            },

            frame = next_upstream(&mut upstream_stream), if upstream_stream.is_some() => {
                match frame {
                    Some(Ok(UpstreamMessage::Text(text))) => bridge.handle_upstream_text(text.as_str()),
                    Some(Ok(UpstreamMessage::Binary(data))) => bridge.handle_upstream_binary(data),
                    Some(Ok(UpstreamMessage::Close(frame))) => {
                        upstream_stream = None;
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_string()),
                            None => (None, String::new()),
                        };
                        bridge.upstream_closed(code, &reason)
                    }
                    Some(Ok(_)) => Vec::new(),
                    Some(Err(e)) => {
                        upstream_stream = None;
                        warn!("Upstream WebSocket error: {}", e);
                        bridge.upstream_closed(None, &e.to_string())
                    }
                    None => {
                        upstream_stream = None;
                        bridge.upstream_closed(None, "")
                    }
                }
            }

            _ = wait_until(settings_deadline), if settings_deadline.is_some() => {
                settings_deadline = None;
                bridge.settings_timed_out()
            }
        };

        if !settings_timer_armed && bridge.handshake().sent {
            settings_timer_armed = true;
            settings_deadline = Some(Instant::now() + settings_timeout);
        }

        if !dispatch(actions, &client, &upstream) {
            break;
        }
    }

    let dropped = bridge.client_closed();
    if dropped > 0 {
        debug!(dropped, "Discarded pending upstream messages");
    }
    upstream.close(Some((1000, "client disconnected".to_string())));
    client.close(None);

    if tokio::time::timeout(CLIENT_DRAIN_TIMEOUT, client_writer)
        .await
        .is_err()
    {
        debug!("Client writer did not finish before drain timeout");
    }

    info!("Relay WebSocket connection terminated");
}

/// Apply bridge actions. Returns `false` once the client socket is being closed.
fn dispatch(actions: Vec<BridgeAction>, client: &OutboundRouter, upstream: &OutboundRouter) -> bool {
    let mut open = true;
    for action in actions {
        match action {
            BridgeAction::Upstream(text) => {
                if upstream.send_text(text) == SendOutcome::NotSent {
                    debug!("Upstream not writable, dropping frame");
                }
            }
            BridgeAction::Client(text) => {
                client.send_text(text);
            }
            BridgeAction::ClientAudio(data) => {
                client.send_binary(data);
            }
            BridgeAction::CloseClient { code, reason } => {
                info!(code, %reason, "Closing client connection");
                client.close(Some((code, reason)));
                open = false;
            }
        }
    }
    open
}

async fn next_upstream(
    stream: &mut Option<SplitStream<WsStream>>,
) -> Option<Result<UpstreamMessage, tungstenite::Error>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Convert a router frame into an axum WebSocket message.
fn to_client_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text.into()),
        OutboundFrame::Binary(data) => Message::Binary(data),
        OutboundFrame::Close(close) => Message::Close(close.map(|(code, reason)| CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}
