//! Voice-agent session client.
//!
//! Drives one conversation with a voice agent over a single WebSocket:
//! settings handshake, gated user content, agent/playback state, VAD events,
//! function calls and history for reconnect-with-context.
//!
//! # Example
//!
//! ```rust,ignore
//! use waav_agent_relay::core::agent::{AgentSession, AgentSessionConfig, Settings};
//!
//! let session = AgentSession::new(AgentSessionConfig::default());
//! session.on_event(callback);
//! session.connect().await?;
//! session.configure(&Settings::default())?;
//! session.inject_user_message("What's the weather like?").await?;
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::messages::{
    AgentClientMessage, AgentServerMessage, SERVER_MESSAGE_TYPES, Settings, SpeakSettings,
};
use crate::core::audio::{FrameKind, SampleBufferValidator, classify_binary};
use crate::core::connection::{AttemptToken, ConnectionState, Service};
use crate::core::events::{
    AgentState, EventCallback, EventEmitter, FunctionCallRequest, FunctionCallResponder,
    PlaybackReason, PlaybackState, SessionEvent,
};
use crate::core::readiness::{ReadinessGate, ReadyOutcome, SettingsHandshake};
use crate::core::router::SendOutcome;
use crate::core::session::{
    Change, ChangeTracker, DEFAULT_HISTORY_LIMIT, Message, Role, SessionContext,
};
use crate::core::storage::SessionStorage;
use crate::core::transport::{
    Credentials, InboundFrame, InboundStream, ServiceConnection, abnormal_close,
};
use crate::core::vad::{SpeechSignal, VadSequencer};
use crate::errors::{AgentError, AgentResult, ErrorDetails};

/// Default voice-agent endpoint.
pub const DEFAULT_AGENT_URL: &str = "wss://agent.deepgram.com/v1/agent/converse";

/// Configuration for an [`AgentSession`].
#[derive(Debug, Clone)]
pub struct AgentSessionConfig {
    pub endpoint: String,
    pub credentials: Credentials,
    /// Stable conversation id; generated when absent
    pub session_id: Option<String>,
    pub history_limit: usize,
    pub connect_timeout: Duration,
    /// How long content sends wait for `SettingsApplied`
    pub readiness_timeout: Duration,
    /// Extra wait after a readiness timeout before sending anyway
    pub readiness_grace: Duration,
}

impl Default for AgentSessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_AGENT_URL.to_string(),
            credentials: Credentials::None,
            session_id: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            connect_timeout: Duration::from_secs(10),
            readiness_timeout: Duration::from_secs(5),
            readiness_grace: Duration::from_secs(2),
        }
    }
}

/// What [`AgentSession::apply_settings`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsUpdate {
    /// Same content as the last applied settings
    Unchanged,
    /// Full `Settings` sent for this attempt
    Sent,
    /// Live updates sent for the fields that changed
    Updated {
        prompt: bool,
        speak: bool,
        /// Other fields changed that only take effect on the next connection
        requires_reconnect: bool,
    },
}

struct AgentInner {
    config: AgentSessionConfig,
    connection: ServiceConnection,
    gate: Arc<ReadinessGate>,
    context: SessionContext,
    emitter: Arc<EventEmitter>,
    validator: SampleBufferValidator,
    vad: Mutex<VadSequencer>,
    agent_state: Mutex<AgentState>,
    playback: Mutex<PlaybackState>,
    settings: ChangeTracker<Settings>,
    reader: Mutex<Option<JoinHandle<()>>>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

/// Client session for the voice-agent protocol.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct AgentSession {
    inner: Arc<AgentInner>,
}

impl AgentSession {
    pub fn new(config: AgentSessionConfig) -> Self {
        let context = SessionContext::new(config.session_id.clone(), config.history_limit);
        Self::with_context(config, context)
    }

    /// Create a session whose history is persisted through `storage`.
    pub fn with_storage(config: AgentSessionConfig, storage: Arc<dyn SessionStorage>) -> Self {
        let context = SessionContext::new(config.session_id.clone(), config.history_limit)
            .with_storage(storage);
        Self::with_context(config, context)
    }

    fn with_context(config: AgentSessionConfig, context: SessionContext) -> Self {
        let connection = ServiceConnection::new(Service::Agent);
        let gate = Arc::new(ReadinessGate::new());
        let emitter = Arc::new(EventEmitter::new());

        {
            let gate = gate.clone();
            let emitter = emitter.clone();
            let machine = Arc::downgrade(connection.machine());
            connection.machine().subscribe(Arc::new(move |service, state| {
                match state {
                    // Reset before `connected` is visible to the host.
                    ConnectionState::Connecting => {
                        if let Some(attempt) =
                            machine.upgrade().and_then(|m| m.current_attempt())
                        {
                            gate.begin_attempt(attempt);
                        }
                    }
                    ConnectionState::Closed | ConnectionState::Error => gate.mark_closed(),
                    _ => {}
                }
                emitter.emit(SessionEvent::ConnectionStateChanged { service, state });
            }));
        }

        Self {
            inner: Arc::new(AgentInner {
                config,
                connection,
                gate,
                context,
                emitter,
                validator: SampleBufferValidator::new(),
                vad: Mutex::new(VadSequencer::new()),
                agent_state: Mutex::new(AgentState::Idle),
                playback: Mutex::new(PlaybackState::Stopped),
                settings: ChangeTracker::new(),
                reader: Mutex::new(None),
                keep_alive: Mutex::new(None),
            }),
        }
    }

    /// Register the host callback.
    pub fn on_event(&self, callback: EventCallback) {
        self.inner.emitter.set_callback(callback);
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Open a new connection attempt.
    ///
    /// Fails if an attempt is already connecting or connected.
    pub async fn connect(&self) -> AgentResult<AttemptToken> {
        let inner = &self.inner;
        inner.emitter.start();

        let stream = match inner
            .connection
            .open(
                &inner.config.endpoint,
                &inner.config.credentials,
                inner.config.connect_timeout,
            )
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                inner
                    .emitter
                    .emit(SessionEvent::Error(e.to_details(Service::Agent)));
                return Err(e);
            }
        };

        let attempt = stream.attempt();
        inner.vad.lock().reset();

        let reader = tokio::spawn(Self::run_reader(Arc::downgrade(inner), stream));
        if let Some(previous) = inner.reader.lock().replace(reader) {
            previous.abort();
        }

        info!(
            session_id = %inner.context.session_id(),
            %attempt,
            "Agent session connected"
        );
        Ok(attempt)
    }

    /// Close the session. Pending sends and readiness waits resolve immediately.
    pub fn close(&self) {
        let inner = &self.inner;
        if let Some(handle) = inner.keep_alive.lock().take() {
            handle.abort();
        }
        inner.gate.mark_closed();
        if inner.connection.close() {
            info!(session_id = %inner.context.session_id(), "Agent session closed");
        }
        if let Some(handle) = inner.reader.lock().take() {
            handle.abort();
        }
        inner.vad.lock().reset();
        self.set_playback(PlaybackState::Stopped, PlaybackReason::AudioDone);
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Send `Settings` for the current attempt.
    ///
    /// Returns `Ok(false)` if settings were already sent on this attempt. When
    /// history exists (reconnect), it is attached as agent context.
    pub fn configure(&self, settings: &Settings) -> AgentResult<bool> {
        let inner = &self.inner;
        let attempt = self.connected_attempt()?;
        if !inner.gate.try_claim_send(attempt) {
            debug!(%attempt, "Settings already sent for this attempt");
            return Ok(false);
        }

        let history = inner.context.history();
        let payload = settings.with_history(&history);
        let json = match serde_json::to_string(&AgentClientMessage::Settings(payload)) {
            Ok(json) => json,
            Err(e) => {
                inner.gate.release_send(attempt);
                return Err(e.into());
            }
        };

        if !inner.connection.send_text(json).is_sent() {
            inner.gate.release_send(attempt);
            return Err(AgentError::NotConnected);
        }
        inner.settings.update(&settings.without_context());
        info!(
            %attempt,
            context_messages = history.len(),
            "Settings sent"
        );
        Ok(true)
    }

    /// Apply settings, sending only what changed since the last call.
    ///
    /// Comparison is structural, so a freshly built but identical value is a no-op.
    pub fn apply_settings(&self, settings: &Settings) -> AgentResult<SettingsUpdate> {
        let inner = &self.inner;
        if !inner.gate.handshake().sent {
            return if self.configure(settings)? {
                Ok(SettingsUpdate::Sent)
            } else {
                Ok(SettingsUpdate::Unchanged)
            };
        }

        let next = settings.without_context();
        let previous = match inner.settings.update(&next) {
            Change::Unchanged | Change::First => return Ok(SettingsUpdate::Unchanged),
            Change::Changed(previous) => previous,
        };

        let prompt = previous.agent.think.prompt != next.agent.think.prompt;
        let speak = previous.agent.speak != next.agent.speak;
        if prompt {
            let text = next.agent.think.prompt.clone().unwrap_or_default();
            self.send_control(&AgentClientMessage::UpdatePrompt { prompt: text })?;
        }
        if speak {
            self.send_control(&AgentClientMessage::UpdateSpeak {
                speak: next.agent.speak.clone(),
            })?;
        }

        let mut rest_prev = previous;
        rest_prev.agent.think.prompt = next.agent.think.prompt.clone();
        rest_prev.agent.speak = next.agent.speak.clone();
        let requires_reconnect = rest_prev != next;
        if requires_reconnect {
            warn!("Settings changed beyond prompt and voice; takes effect on reconnect");
        }

        Ok(SettingsUpdate::Updated {
            prompt,
            speak,
            requires_reconnect,
        })
    }

    /// Replace the agent's instructions.
    pub fn update_instructions(&self, prompt: impl Into<String>) -> AgentResult<SendOutcome> {
        let prompt = prompt.into();
        if let Some(mut current) = self.inner.settings.current() {
            current.agent.think.prompt = Some(prompt.clone());
            self.inner.settings.update(&current);
        }
        self.send_control(&AgentClientMessage::UpdatePrompt { prompt })
    }

    /// Switch the agent's voice.
    pub fn update_speak(&self, speak: SpeakSettings) -> AgentResult<SendOutcome> {
        if let Some(mut current) = self.inner.settings.current() {
            current.agent.speak = speak.clone();
            self.inner.settings.update(&current);
        }
        self.send_control(&AgentClientMessage::UpdateSpeak { speak })
    }

    // =========================================================================
    // Content
    // =========================================================================

    /// Send a user text turn once settings are accepted.
    ///
    /// If acceptance does not arrive within the readiness timeout, a
    /// `settings_not_applied` warning is emitted and the send is attempted after
    /// one more bounded wait. Returns [`AgentError::Closed`] if the session closes
    /// while waiting.
    pub async fn inject_user_message(&self, content: impl Into<String>) -> AgentResult<SendOutcome> {
        self.send_content(AgentClientMessage::InjectUserMessage {
            content: content.into(),
        })
        .await
    }

    /// Make the agent say `message`.
    pub async fn inject_agent_message(&self, message: impl Into<String>) -> AgentResult<SendOutcome> {
        self.send_content(AgentClientMessage::InjectAgentMessage {
            message: message.into(),
        })
        .await
    }

    pub async fn send_function_call_response(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> AgentResult<SendOutcome> {
        self.send_content(AgentClientMessage::FunctionCallResponse {
            id: id.into(),
            name: name.into(),
            content: content.into(),
        })
        .await
    }

    pub fn keep_alive(&self) -> AgentResult<SendOutcome> {
        self.send_control(&AgentClientMessage::KeepAlive)
    }

    /// Send `KeepAlive` every `interval` while connected.
    pub fn spawn_keep_alive(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.connection.state() != ConnectionState::Connected {
                    break;
                }
                let session = AgentSession { inner };
                if let Err(e) = session.keep_alive() {
                    debug!("Keep-alive not sent: {}", e);
                }
            }
        });
        if let Some(previous) = self.inner.keep_alive.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Send microphone audio.
    ///
    /// Audio is only sent after settings are accepted; odd-length buffers are repaired.
    pub fn send_audio(&self, data: Bytes) -> SendOutcome {
        let inner = &self.inner;
        if !inner.gate.is_ready() {
            return SendOutcome::NotSent;
        }
        match inner.validator.validate(data) {
            Some(frame) => inner.connection.send_binary(frame.into_bytes()),
            None => SendOutcome::NotSent,
        }
    }

    // =========================================================================
    // Sleep
    // =========================================================================

    /// Put the agent to sleep locally.
    pub fn sleep(&self) {
        self.force_agent_state(AgentState::EnteringSleep);
        self.force_agent_state(AgentState::Sleeping);
    }

    pub fn wake(&self) {
        let state = *self.inner.agent_state.lock();
        if matches!(state, AgentState::Sleeping | AgentState::EnteringSleep) {
            self.force_agent_state(AgentState::Idle);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn session_id(&self) -> &str {
        self.inner.context.session_id()
    }

    pub fn history(&self) -> Vec<Message> {
        self.inner.context.history()
    }

    pub fn append_message(&self, message: Message) {
        self.inner.context.append_message(message);
    }

    pub async fn persist(&self) -> AgentResult<()> {
        self.inner.context.persist().await
    }

    pub async fn restore(&self) -> AgentResult<usize> {
        self.inner.context.restore().await
    }

    pub fn agent_state(&self) -> AgentState {
        *self.inner.agent_state.lock()
    }

    pub fn playback_state(&self) -> PlaybackState {
        *self.inner.playback.lock()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn handshake(&self) -> SettingsHandshake {
        self.inner.gate.handshake()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.gate.is_ready()
    }

    pub fn is_user_speaking(&self) -> bool {
        self.inner.vad.lock().is_user_speaking()
    }

    /// Wait for settings acceptance on the current attempt.
    pub async fn wait_until_ready(&self, timeout: Duration) -> ReadyOutcome {
        self.inner.gate.wait_until_ready(timeout).await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn connected_attempt(&self) -> AgentResult<AttemptToken> {
        let machine = self.inner.connection.machine();
        match (machine.state(), machine.current_attempt()) {
            (ConnectionState::Connected, Some(attempt)) => Ok(attempt),
            _ => Err(AgentError::NotConnected),
        }
    }

    /// Send any client message, routed by kind.
    ///
    /// `Settings` goes through [`configure`](Self::configure), content waits for
    /// settings like [`inject_user_message`](Self::inject_user_message), and
    /// everything else is written immediately.
    pub async fn send(&self, message: AgentClientMessage) -> AgentResult<SendOutcome> {
        match message {
            AgentClientMessage::Settings(settings) => Ok(if self.configure(&settings)? {
                SendOutcome::Sent
            } else {
                SendOutcome::NotSent
            }),
            message if message.is_content() => self.send_content(message).await,
            message => self.send_control(&message),
        }
    }

    /// Write a message that does not depend on settings being applied.
    fn send_control(&self, message: &AgentClientMessage) -> AgentResult<SendOutcome> {
        if message.is_content() {
            return Err(AgentError::Protocol(format!(
                "{} must wait for settings",
                message.type_name()
            )));
        }
        self.write_message(message)
    }

    fn write_message(&self, message: &AgentClientMessage) -> AgentResult<SendOutcome> {
        self.connected_attempt()?;
        let json = serde_json::to_string(message)?;
        Ok(self.inner.connection.send_text(json))
    }

    async fn send_content(&self, message: AgentClientMessage) -> AgentResult<SendOutcome> {
        let inner = &self.inner;
        self.connected_attempt()?;

        match inner.gate.wait_until_ready(inner.config.readiness_timeout).await {
            ReadyOutcome::Ready => {}
            ReadyOutcome::Closed => return Err(AgentError::Closed),
            ReadyOutcome::TimedOut => {
                error!(
                    session_id = %inner.context.session_id(),
                    message_type = message.type_name(),
                    timeout_ms = inner.config.readiness_timeout.as_millis() as u64,
                    "Settings not applied before content send; the agent may drop this message"
                );
                inner.emitter.emit(SessionEvent::Warning(
                    ErrorDetails::new(
                        Service::Agent,
                        "settings_not_applied",
                        format!(
                            "{} sent before SettingsApplied was received",
                            message.type_name()
                        ),
                    )
                    .recoverable(true),
                ));
                if inner.gate.wait_until_ready(inner.config.readiness_grace).await
                    == ReadyOutcome::Closed
                {
                    return Err(AgentError::Closed);
                }
            }
        }

        self.write_message(&message)
    }

    fn set_agent_state(&self, state: AgentState) {
        {
            let current = self.inner.agent_state.lock();
            if matches!(*current, AgentState::Sleeping | AgentState::EnteringSleep) {
                debug!(ignored = %state, "Agent asleep, ignoring state change");
                return;
            }
        }
        self.force_agent_state(state);
    }

    fn force_agent_state(&self, state: AgentState) {
        {
            let mut current = self.inner.agent_state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!(%state, "Agent state changed");
        self.inner.emitter.emit(SessionEvent::AgentStateChanged(state));
    }

    fn set_playback(&self, state: PlaybackState, reason: PlaybackReason) {
        {
            let mut current = self.inner.playback.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        self.inner
            .emitter
            .emit(SessionEvent::PlaybackStateChanged { state, reason });
    }

    async fn run_reader(weak: Weak<AgentInner>, mut stream: InboundStream) {
        let attempt = stream.attempt();
        while let Some(frame) = stream.next_frame().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let session = AgentSession { inner };
            match frame {
                InboundFrame::Text(text) => session.handle_text(attempt, &text),
                InboundFrame::Binary(data) => match classify_binary(&data, SERVER_MESSAGE_TYPES) {
                    FrameKind::Control(text) => session.handle_text(attempt, &text),
                    FrameKind::Audio(audio) => session.handle_audio(audio),
                },
                InboundFrame::Closed { code, reason } => {
                    info!(?code, %reason, %attempt, "Agent socket closed by server");
                    if session.inner.connection.transport_ended(attempt, false)
                        && let Some(details) = abnormal_close(Service::Agent, code, &reason)
                    {
                        session.inner.emitter.emit(SessionEvent::Error(details));
                    }
                }
                InboundFrame::Failed(e) => {
                    warn!(%attempt, "Agent socket failed: {}", e);
                    if session.inner.connection.transport_ended(attempt, true) {
                        session.inner.emitter.emit(SessionEvent::Error(
                            AgentError::WebSocket(e).to_details(Service::Agent),
                        ));
                    }
                }
            }
        }
    }

    fn handle_text(&self, attempt: AttemptToken, text: &str) {
        let message = match serde_json::from_str::<AgentServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed agent message: {}", e);
                return;
            }
        };
        let inner = &self.inner;

        match message {
            AgentServerMessage::Welcome { request_id } => {
                debug!(%request_id, "Agent welcome");
            }
            AgentServerMessage::SettingsApplied => {
                if inner.gate.mark_accepted(attempt) {
                    info!(%attempt, "Settings applied");
                }
            }
            AgentServerMessage::PromptUpdated => debug!("Prompt updated"),
            AgentServerMessage::SpeakUpdated => debug!("Speak updated"),
            AgentServerMessage::ConversationText { role, content } => {
                inner
                    .context
                    .append_message(Message::new(role, content.clone()));
                let event = match role {
                    Role::User => SessionEvent::UserMessage(content),
                    Role::Assistant => SessionEvent::AgentUtterance(content),
                };
                inner.emitter.emit(event);
            }
            AgentServerMessage::UserStartedSpeaking => {
                let event = inner
                    .vad
                    .lock()
                    .process(SpeechSignal::Started { channel: None });
                inner
                    .emitter
                    .emit(SessionEvent::from_vad(Service::Agent, event));
                if self.playback_state() == PlaybackState::Playing {
                    self.set_playback(PlaybackState::Stopped, PlaybackReason::Interrupted);
                }
                self.set_agent_state(AgentState::Listening);
            }
            AgentServerMessage::AgentThinking { .. } => {
                self.set_agent_state(AgentState::Thinking);
            }
            AgentServerMessage::AgentStartedSpeaking { total_latency, .. } => {
                if let Some(latency) = total_latency {
                    debug!(total_latency = latency, "Agent started speaking");
                }
                self.set_agent_state(AgentState::Speaking);
            }
            AgentServerMessage::AgentAudioDone => {
                self.set_playback(PlaybackState::Stopped, PlaybackReason::AudioDone);
                self.set_agent_state(AgentState::Idle);
            }
            AgentServerMessage::FunctionCallRequest { functions } => {
                for request in functions {
                    self.emit_function_call(request);
                }
            }
            AgentServerMessage::Error { description, code } => {
                error!(%code, "Agent error: {}", description);
                inner.emitter.emit(SessionEvent::Error(ErrorDetails::new(
                    Service::Agent,
                    code,
                    description,
                )));
            }
            AgentServerMessage::Warning { description, code } => {
                warn!(%code, "Agent warning: {}", description);
                inner.emitter.emit(SessionEvent::Warning(
                    ErrorDetails::new(Service::Agent, code, description).recoverable(true),
                ));
            }
            AgentServerMessage::Unknown => {
                debug!("Ignoring unknown agent message");
            }
        }
    }

    fn handle_audio(&self, data: Bytes) {
        let Some(frame) = self.inner.validator.validate(data) else {
            return;
        };
        if self.playback_state() == PlaybackState::Stopped {
            self.set_playback(PlaybackState::Playing, PlaybackReason::AudioStarted);
        }
        self.inner.emitter.emit(SessionEvent::AgentAudio(frame));
    }

    fn emit_function_call(&self, request: FunctionCallRequest) {
        let weak = Arc::downgrade(&self.inner);
        let id = request.id.clone();
        let name = request.name.clone();
        let responder = FunctionCallResponder::new(Arc::new(move |content: String| {
            let inner = weak.upgrade().ok_or(AgentError::Closed)?;
            if !inner.gate.is_ready() {
                return Ok(SendOutcome::NotSent);
            }
            AgentSession { inner }.write_message(&AgentClientMessage::FunctionCallResponse {
                id: id.clone(),
                name: name.clone(),
                content,
            })
        }));
        self.inner
            .emitter
            .emit(SessionEvent::FunctionCallRequested { request, responder });
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        if let Some(handle) = self.keep_alive.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.connection.close();
    }
}
