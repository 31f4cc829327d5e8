//! WebSocket transport for one service.
//!
//! [`ServiceConnection`] glues a [`ConnectionStateMachine`] to a tungstenite socket:
//! it opens the socket under a fresh [`AttemptToken`], runs the single writer task,
//! and hands the read half back to the owner as an [`InboundStream`].

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::SplitStream;
use http::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use super::connection::{AttemptToken, ConnectionState, ConnectionStateMachine, Service};
use super::router::{OutboundFrame, OutboundRouter, SendOutcome, drive_writer};
use crate::errors::{AgentError, AgentResult, ErrorDetails};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection-time credentials.
#[derive(Clone, Default)]
pub enum Credentials {
    #[default]
    None,
    /// `Authorization: Token <key>`
    Token(String),
    /// `Authorization: Bearer <key>`
    Bearer(String),
}

impl Credentials {
    fn header_value(&self) -> Option<String> {
        match self {
            Credentials::None => None,
            Credentials::Token(key) => Some(format!("Token {key}")),
            Credentials::Bearer(key) => Some(format!("Bearer {key}")),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::None => write!(f, "None"),
            Credentials::Token(_) => write!(f, "Token(***)"),
            Credentials::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        match self {
            Credentials::Token(key) | Credentials::Bearer(key) => key.zeroize(),
            Credentials::None => {}
        }
    }
}

/// Frame read from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Text(String),
    Binary(Bytes),
    /// Remote closed the socket
    Closed { code: Option<u16>, reason: String },
    /// Transport failed
    Failed(String),
}

/// Error to report for a server-initiated close, if it was not a normal one.
///
/// A socket that ends without a close frame counts as abnormal.
pub fn abnormal_close(service: Service, code: Option<u16>, reason: &str) -> Option<ErrorDetails> {
    if code == Some(1000) {
        return None;
    }
    let message = match code {
        Some(code) => format!("{service} closed the connection ({code}): {reason}"),
        None => format!("{service} connection ended without a close frame"),
    };
    Some(
        ErrorDetails::new(service, "connection_closed", message)
            .with_details(serde_json::json!({ "code": code, "reason": reason })),
    )
}

/// Read half of an open socket, tied to the attempt that opened it.
pub struct InboundStream {
    attempt: AttemptToken,
    stream: SplitStream<WsStream>,
    done: bool,
}

impl InboundStream {
    pub fn attempt(&self) -> AttemptToken {
        self.attempt
    }

    /// Next data or terminal frame. Returns `None` once a terminal frame was yielded.
    pub async fn next_frame(&mut self) -> Option<InboundFrame> {
        if self.done {
            return None;
        }
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(Message::Text(text))) => InboundFrame::Text(text.to_string()),
                Some(Ok(Message::Binary(data))) => InboundFrame::Binary(data),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                        .unwrap_or((None, String::new()));
                    InboundFrame::Closed { code, reason }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => InboundFrame::Failed(e.to_string()),
                None => InboundFrame::Closed {
                    code: None,
                    reason: String::new(),
                },
            };
            if matches!(
                frame,
                InboundFrame::Closed { .. } | InboundFrame::Failed(_)
            ) {
                self.done = true;
            }
            return Some(frame);
        }
    }
}

/// Owned socket for one service: state machine, writer and router.
pub struct ServiceConnection {
    machine: Arc<ConnectionStateMachine>,
    router: Mutex<Option<OutboundRouter>>,
}

impl ServiceConnection {
    pub fn new(service: Service) -> Self {
        Self {
            machine: Arc::new(ConnectionStateMachine::new(service)),
            router: Mutex::new(None),
        }
    }

    pub fn service(&self) -> Service {
        self.machine.service()
    }

    pub fn machine(&self) -> &Arc<ConnectionStateMachine> {
        &self.machine
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// Open a socket to `endpoint` under a new attempt.
    ///
    /// HTTP 401/403 during the upgrade map to [`AgentError::AuthenticationFailed`];
    /// anything else that prevents the upgrade maps to [`AgentError::ConnectionFailed`].
    pub async fn open(
        &self,
        endpoint: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> AgentResult<InboundStream> {
        let service = self.service();
        let attempt = self.machine.begin_attempt()?;

        let ws = match Self::connect(endpoint, credentials, timeout).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(%service, %attempt, "Connection failed: {}", e);
                self.machine.mark_error(attempt);
                return Err(e);
            }
        };

        let (sink, stream) = ws.split();
        let (router, rx) = OutboundRouter::new(false);
        tokio::spawn(drive_writer(sink, rx, router.clone(), to_ws_message));

        // Router must be live before `connected` is observed.
        router.mark_open();
        if let Some(previous) = self.router.lock().replace(router.clone()) {
            previous.teardown();
        }
        if self.machine.mark_connected(attempt).is_err() {
            // Closed while the upgrade was in flight.
            let mut slot = self.router.lock();
            if slot.as_ref().is_some_and(|current| current.same_channel(&router)) {
                slot.take();
            }
            drop(slot);
            router.close(None);
            return Err(AgentError::Closed);
        }

        info!(%service, %attempt, "Connected to {}", endpoint);
        Ok(InboundStream {
            attempt,
            stream,
            done: false,
        })
    }

    async fn connect(
        endpoint: &str,
        credentials: &Credentials,
        timeout: Duration,
    ) -> AgentResult<WsStream> {
        let headers: Vec<(String, String)> = credentials
            .header_value()
            .map(|value| ("Authorization".to_string(), value))
            .into_iter()
            .collect();
        connect_websocket(endpoint, &headers, timeout).await
    }

    /// Send a text frame on the current socket.
    pub fn send_text(&self, text: impl Into<String>) -> SendOutcome {
        match self.current_router() {
            Some(router) => router.send_text(text),
            None => SendOutcome::NotSent,
        }
    }

    pub fn send_binary(&self, data: Bytes) -> SendOutcome {
        match self.current_router() {
            Some(router) => router.send_binary(data),
            None => SendOutcome::NotSent,
        }
    }

    /// Router of the live socket, if the machine reports `connected`.
    pub fn current_router(&self) -> Option<OutboundRouter> {
        if self.machine.state() != ConnectionState::Connected {
            return None;
        }
        self.router.lock().clone()
    }

    /// Record that the socket opened by `attempt` ended.
    ///
    /// Stale attempts are ignored. Returns `true` if the state changed.
    pub fn transport_ended(&self, attempt: AttemptToken, failed: bool) -> bool {
        if !self.machine.is_current(attempt) {
            return false;
        }
        if let Some(router) = self.router.lock().take() {
            router.teardown();
        }
        if failed {
            self.machine.mark_error(attempt)
        } else {
            self.machine.mark_closed(attempt)
        }
    }

    /// Close the socket gracefully. Safe to call repeatedly.
    pub fn close(&self) -> bool {
        if let Some(router) = self.router.lock().take() {
            router.close(Some((1000, "client closed".to_string())));
        }
        let changed = self.machine.close();
        if changed {
            debug!(service = %self.service(), "Service connection closed");
        }
        changed
    }
}

/// Dial a WebSocket endpoint with extra request headers.
///
/// Later headers replace earlier ones with the same name. HTTP 401/403 during the
/// upgrade map to [`AgentError::AuthenticationFailed`].
pub async fn connect_websocket(
    endpoint: &str,
    headers: &[(String, String)],
    timeout: Duration,
) -> AgentResult<WsStream> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| AgentError::InvalidConfiguration(format!("Invalid endpoint: {e}")))?;

    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            AgentError::InvalidConfiguration(format!("Invalid header name '{name}'"))
        })?;
        let mut value = HeaderValue::from_str(value).map_err(|_| {
            AgentError::InvalidConfiguration(format!("Header {name} contains invalid characters"))
        })?;
        if name == http::header::AUTHORIZATION {
            value.set_sensitive(true);
        }
        request.headers_mut().insert(name, value);
    }

    let (ws, _response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| AgentError::Timeout(format!("Connecting to {endpoint}")))?
        .map_err(map_connect_error)?;
    Ok(ws)
}

fn map_connect_error(error: tungstenite::Error) -> AgentError {
    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == http::StatusCode::UNAUTHORIZED || status == http::StatusCode::FORBIDDEN {
                AgentError::AuthenticationFailed(format!("Upgrade rejected with {status}"))
            } else {
                AgentError::ConnectionFailed(format!("Upgrade rejected with {status}"))
            }
        }
        other => AgentError::ConnectionFailed(other.to_string()),
    }
}

/// Convert a router frame into a tungstenite message.
pub fn to_ws_message(frame: OutboundFrame) -> Message {
    match frame {
        OutboundFrame::Text(text) => Message::Text(text.into()),
        OutboundFrame::Binary(data) => Message::Binary(data),
        OutboundFrame::Close(close) => Message::Close(close.map(|(code, reason)| CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}
