//! Mock WebSocket peers shared by the integration tests.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};

use waav_agent_relay::{ServerConfig, create_app, state::AppState};

pub type MockSocket = WebSocketStream<TcpStream>;

/// Direction of a frame as seen by the mock peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Received,
    Sent,
}

/// One frame observed by a mock peer, with the time it was observed.
#[derive(Debug, Clone)]
pub struct Observed {
    pub at: Instant,
    pub direction: Direction,
    pub message_type: String,
    pub body: serde_json::Value,
}

/// Upgrade request as seen by the mock peer.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl Handshake {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Records frames so tests can assert on ordering and timing.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::UnboundedSender<Observed>,
}

impl Recorder {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Observed>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn received(&self, text: &str) -> serde_json::Value {
        self.record(Direction::Received, text)
    }

    /// Send `body` on `ws` and record it once written.
    pub async fn send(&self, ws: &mut MockSocket, body: serde_json::Value) {
        let text = body.to_string();
        if ws.send(Message::Text(text.clone().into())).await.is_ok() {
            self.record(Direction::Sent, &text);
        }
    }

    fn record(&self, direction: Direction, text: &str) -> serde_json::Value {
        let body: serde_json::Value = serde_json::from_str(text).unwrap_or_default();
        let message_type = body["type"].as_str().unwrap_or_default().to_string();
        let _ = self.tx.send(Observed {
            at: Instant::now(),
            direction,
            message_type,
            body: body.clone(),
        });
        body
    }
}

/// Start a mock WebSocket server; `handler` runs once per accepted connection.
///
/// Returns the `ws://` URL and a channel yielding each connection's handshake.
pub async fn spawn_mock<F, Fut>(handler: F) -> (String, mpsc::UnboundedReceiver<Handshake>)
where
    F: Fn(MockSocket) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            let handshake_tx = handshake_tx.clone();
            tokio::spawn(async move {
                let callback = |request: &Request,
                                response: Response|
                 -> Result<Response, ErrorResponse> {
                    let _ = handshake_tx.send(Handshake {
                        uri: request.uri().to_string(),
                        headers: request
                            .headers()
                            .iter()
                            .map(|(n, v)| {
                                (n.to_string(), v.to_str().unwrap_or_default().to_string())
                            })
                            .collect(),
                    });
                    Ok(response)
                };
                if let Ok(ws) = accept_hdr_async(stream, callback).await {
                    handler(ws).await;
                }
            });
        }
    });

    (format!("ws://{addr}"), handshake_rx)
}

/// A port nothing is listening on.
pub fn unused_port() -> u16 {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Relay configuration pointing at `upstream_url`, with auth disabled.
pub fn relay_config(upstream_url: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.upstream_url = upstream_url.to_string();
    config.upstream_api_key = Some("sk-test".to_string());
    config
}

/// Serve the relay on an ephemeral port.
pub async fn start_relay(config: ServerConfig) -> (SocketAddr, Arc<AppState>) {
    let state = AppState::new(config);
    let app = create_app(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

/// Wait for the next observed frame of `message_type`.
pub async fn next_of_type(
    rx: &mut mpsc::UnboundedReceiver<Observed>,
    message_type: &str,
) -> Observed {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let observed = rx.recv().await.expect("recorder closed");
            if observed.message_type == message_type {
                return observed;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {message_type}"))
}

/// Read text frames from a client socket until one has `message_type`.
pub async fn client_next_of_type<S>(ws: &mut S, message_type: &str) -> serde_json::Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let body: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                    if body["type"] == message_type {
                        return body;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended while waiting for {message_type}: {other:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {message_type}"))
}
