//! Voice-agent protocol to upstream realtime protocol translation.
//!
//! [`ProtocolBridge`] is a pure state machine: it takes frames from either side
//! and returns the [`BridgeAction`]s to perform. It owns the upstream ordering
//! rules the client does not know about:
//!
//! - nothing but configuration goes upstream before `session.updated` confirms it
//! - `response.create` for a turn waits until `conversation.item.created` for that turn
//! - `SettingsApplied` reaches the client only after upstream really accepted
//! - an upstream close before readiness becomes a typed error for the client

use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, error, info, warn};

use super::pending::{PendingOutboundItem, PendingQueue, Prerequisite, Release};
use crate::core::agent::messages::{
    AgentClientMessage, AgentServerMessage, CLIENT_MESSAGE_TYPES, Settings, SpeakSettings,
};
use crate::core::audio::{FrameKind, SampleBufferValidator, classify_binary};
use crate::core::events::FunctionCallRequest;
use crate::core::readiness::SettingsHandshake;
use crate::core::session::{DEFAULT_HISTORY_LIMIT, Role};
use crate::core::upstream::messages::{
    ClientEvent, ConversationItem, InputAudioTranscription, ResponseConfig, ServerEvent,
    SessionConfig, ToolDef, TurnDetection,
};
use crate::errors::{BridgeError, BridgeResult};

/// Error code sent to the client when upstream closes before settings were applied.
pub const UPSTREAM_CLOSED_BEFORE_READY: &str = "UPSTREAM_CLOSED_BEFORE_READY";

/// Warning code sent when upstream is slow to apply settings.
pub const SETTINGS_NOT_APPLIED: &str = "SETTINGS_NOT_APPLIED";

/// Close code used when the upstream code cannot be forwarded.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Something the relay must do after feeding a frame to the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeAction {
    /// Text frame to upstream
    Upstream(String),
    /// Text frame to the client
    Client(String),
    /// Binary PCM16 frame to the client
    ClientAudio(Bytes),
    /// Close the client socket
    CloseClient { code: u16, reason: String },
}

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    /// Voice used when the client's settings name none
    pub default_voice: Option<String>,
    /// Model for upstream input transcription
    pub transcription_model: String,
    /// Most recent context messages replayed from `Settings`
    pub history_limit: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            default_voice: None,
            transcription_model: "whisper-1".to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Which client request a `session.updated` acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpectedAck {
    Settings,
    Prompt,
    Speak,
}

/// Translation state for one client/upstream pair.
pub struct ProtocolBridge {
    options: BridgeOptions,
    handshake: SettingsHandshake,
    pending: PendingQueue,
    expected_acks: VecDeque<ExpectedAck>,
    acknowledged_items: HashSet<String>,
    failed_items: HashSet<String>,
    /// event_id -> item id, for correlating upstream errors
    item_events: HashMap<String, String>,
    /// call_id -> function name
    function_names: HashMap<String, String>,
    speaking_responses: HashSet<String>,
    validator: SampleBufferValidator,
    closed: bool,
}

impl Default for ProtocolBridge {
    fn default() -> Self {
        Self::new(BridgeOptions::default())
    }
}

impl ProtocolBridge {
    pub fn new(options: BridgeOptions) -> Self {
        Self {
            options,
            handshake: SettingsHandshake::default(),
            pending: PendingQueue::new(),
            expected_acks: VecDeque::new(),
            acknowledged_items: HashSet::new(),
            failed_items: HashSet::new(),
            item_events: HashMap::new(),
            function_names: HashMap::new(),
            speaking_responses: HashSet::new(),
            validator: SampleBufferValidator::new(),
            closed: false,
        }
    }

    /// Whether upstream has confirmed the client's settings.
    pub fn is_configured(&self) -> bool {
        self.handshake.accepted
    }

    pub fn handshake(&self) -> SettingsHandshake {
        self.handshake
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // =========================================================================
    // Client -> upstream
    // =========================================================================

    /// Translate a client text frame. Failures are logged and the frame dropped.
    pub fn handle_client_text(&mut self, text: &str) -> Vec<BridgeAction> {
        if self.closed {
            return Vec::new();
        }
        match self.translate_client_text(text) {
            Ok(actions) => actions,
            Err(e) => {
                warn!("Dropping client message: {}", e);
                Vec::new()
            }
        }
    }

    /// Translate a client binary frame: audio, or a control message sent as binary.
    pub fn handle_client_binary(&mut self, data: Bytes) -> Vec<BridgeAction> {
        if self.closed {
            return Vec::new();
        }
        match classify_binary(&data, CLIENT_MESSAGE_TYPES) {
            FrameKind::Control(text) => self.handle_client_text(&text),
            FrameKind::Audio(audio) => {
                let Some(frame) = self.validator.validate(audio) else {
                    return Vec::new();
                };
                let payload = match to_json(&ClientEvent::audio_append(frame.as_bytes())) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Dropping client audio: {}", e);
                        return Vec::new();
                    }
                };
                if self.is_configured() && self.pending.is_empty() {
                    vec![BridgeAction::Upstream(payload)]
                } else {
                    self.enqueue(payload, Prerequisite::SessionConfigured, "input_audio_buffer.append")
                }
            }
        }
    }

    pub fn translate_client_text(&mut self, text: &str) -> BridgeResult<Vec<BridgeAction>> {
        let message: AgentClientMessage = serde_json::from_str(text)?;
        debug!(message_type = message.type_name(), "Client message");

        let actions = match message {
            AgentClientMessage::Settings(settings) => self.translate_settings(&settings)?,
            AgentClientMessage::UpdatePrompt { prompt } => {
                self.expected_acks.push_back(ExpectedAck::Prompt);
                let event = ClientEvent::SessionUpdate {
                    session: SessionConfig {
                        instructions: Some(prompt),
                        ..Default::default()
                    },
                };
                self.enqueue(to_json(&event)?, Prerequisite::SessionConfigured, "session.update")
            }
            AgentClientMessage::UpdateSpeak { speak } => {
                self.expected_acks.push_back(ExpectedAck::Speak);
                let event = ClientEvent::SessionUpdate {
                    session: SessionConfig {
                        voice: self.voice_for(&speak),
                        ..Default::default()
                    },
                };
                self.enqueue(to_json(&event)?, Prerequisite::SessionConfigured, "session.update")
            }
            AgentClientMessage::InjectUserMessage { content } => {
                let item = ConversationItem::text_message(None, Role::User.as_str(), content);
                self.enqueue_turn(item)?
            }
            AgentClientMessage::InjectAgentMessage { message } => {
                let id = new_item_id();
                let item =
                    ConversationItem::text_message(Some(id), Role::Assistant.as_str(), message);
                let event = ClientEvent::item_create(item);
                self.enqueue(to_json(&event)?, Prerequisite::SessionConfigured, "conversation.item.create")
            }
            AgentClientMessage::FunctionCallResponse { id, name, content } => {
                debug!(call_id = %id, function = %name, "Function call output");
                let item = ConversationItem::function_call_output(None, id, content);
                self.enqueue_turn(item)?
            }
            AgentClientMessage::KeepAlive => Vec::new(),
        };
        Ok(actions)
    }

    fn translate_settings(&mut self, settings: &Settings) -> BridgeResult<Vec<BridgeAction>> {
        let agent = &settings.agent;
        let tools = agent.think.functions.as_ref().map(|functions| {
            functions
                .iter()
                .map(|f| ToolDef {
                    tool_type: "function".to_string(),
                    name: f.name.clone(),
                    description: f.description.clone(),
                    parameters: f.parameters.clone(),
                })
                .collect::<Vec<_>>()
        });

        let session = SessionConfig {
            modalities: Some(vec!["text".to_string(), "audio".to_string()]),
            instructions: agent.think.prompt.clone(),
            voice: self.voice_for(&agent.speak),
            input_audio_format: Some(upstream_audio_format(&settings.audio.input.encoding)),
            output_audio_format: Some(upstream_audio_format(&settings.audio.output.encoding)),
            input_audio_transcription: Some(InputAudioTranscription {
                model: self.options.transcription_model.clone(),
            }),
            turn_detection: Some(TurnDetection::server_vad()),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
        };
        let update = to_json(&ClientEvent::SessionUpdate { session })?;

        self.expected_acks.push_back(ExpectedAck::Settings);
        let mut actions = if self.handshake.sent {
            // Later Settings behave like any other update.
            self.enqueue(update, Prerequisite::SessionConfigured, "session.update")
        } else {
            self.handshake.sent = true;
            vec![BridgeAction::Upstream(update)]
        };

        // Context is replayed only after the configuration round-trip.
        if let Some(context) = &agent.context {
            let skip = context
                .messages
                .len()
                .saturating_sub(self.options.history_limit);
            if skip > 0 {
                debug!(skip, "Trimming replayed context to history limit");
            }
            for message in context.messages.iter().skip(skip) {
                let item = ConversationItem::text_message(
                    Some(new_item_id()),
                    message.role.as_str(),
                    message.content.clone(),
                );
                actions.extend(self.enqueue(
                    to_json(&ClientEvent::item_create(item))?,
                    Prerequisite::SessionConfigured,
                    "conversation.item.create",
                ));
            }
        }

        if let Some(greeting) = agent.greeting.as_ref().filter(|g| !g.is_empty()) {
            let event = ClientEvent::ResponseCreate {
                response: Some(ResponseConfig {
                    modalities: None,
                    instructions: Some(format!("Greet the user by saying exactly: {greeting}")),
                }),
            };
            actions.extend(self.enqueue(
                to_json(&event)?,
                Prerequisite::SessionConfigured,
                "response.create",
            ));
        }

        Ok(actions)
    }

    /// Queue an item plus the `response.create` that must wait for its acknowledgement.
    fn enqueue_turn(&mut self, mut item: ConversationItem) -> BridgeResult<Vec<BridgeAction>> {
        let id = new_item_id();
        item.id = Some(id.clone());
        let event_id = format!("evt_{}", &id[ITEM_ID_PREFIX.len()..]);
        self.item_events.insert(event_id.clone(), id.clone());

        let create = ClientEvent::ConversationItemCreate {
            item,
            previous_item_id: None,
            event_id: Some(event_id),
        };
        let mut actions = self.enqueue(
            to_json(&create)?,
            Prerequisite::SessionConfigured,
            "conversation.item.create",
        );
        actions.extend(self.enqueue(
            to_json(&ClientEvent::response_create())?,
            Prerequisite::ItemAcknowledged(id),
            "response.create",
        ));
        Ok(actions)
    }

    fn enqueue(
        &mut self,
        payload: String,
        depends_on: Prerequisite,
        kind: &'static str,
    ) -> Vec<BridgeAction> {
        self.pending.push(PendingOutboundItem {
            payload,
            depends_on,
            kind,
        });
        self.release_pending()
    }

    fn release_pending(&mut self) -> Vec<BridgeAction> {
        let configured = self.handshake.accepted;
        let acknowledged = &self.acknowledged_items;
        let failed = &self.failed_items;
        let released = self.pending.release(|prerequisite| match prerequisite {
            Prerequisite::SessionConfigured if configured => Release::Send,
            Prerequisite::SessionConfigured => Release::Wait,
            Prerequisite::ItemAcknowledged(id) if acknowledged.contains(id) => Release::Send,
            Prerequisite::ItemAcknowledged(id) if failed.contains(id) => Release::Discard,
            Prerequisite::ItemAcknowledged(_) => Release::Wait,
        });

        // Only outcomes something still waits on are kept.
        let awaited: HashSet<&str> = self.pending.awaited_items().collect();
        self.acknowledged_items.retain(|id| awaited.contains(id.as_str()));
        self.failed_items.retain(|id| awaited.contains(id.as_str()));

        released.into_iter().map(BridgeAction::Upstream).collect()
    }

    fn voice_for(&self, speak: &SpeakSettings) -> Option<String> {
        speak
            .voice
            .clone()
            .or_else(|| self.options.default_voice.clone())
    }

    // =========================================================================
    // Upstream -> client
    // =========================================================================

    /// Translate an upstream text frame. Failures are logged and the frame dropped.
    pub fn handle_upstream_text(&mut self, text: &str) -> Vec<BridgeAction> {
        if self.closed {
            return Vec::new();
        }
        match self.translate_upstream_text(text) {
            Ok(actions) => actions,
            Err(BridgeError::Unsupported(event_type)) => {
                debug!(%event_type, "Ignoring upstream event");
                Vec::new()
            }
            Err(e) => {
                warn!("Dropping upstream message: {}", e);
                Vec::new()
            }
        }
    }

    /// Binary frames from upstream are treated as raw PCM16.
    pub fn handle_upstream_binary(&mut self, data: Bytes) -> Vec<BridgeAction> {
        if self.closed {
            return Vec::new();
        }
        if let Ok(text) = std::str::from_utf8(&data)
            && serde_json::from_str::<ServerEvent>(text)
                .is_ok_and(|event| !matches!(event, ServerEvent::Unknown))
        {
            return self.handle_upstream_text(text);
        }
        self.validator
            .validate(data)
            .map(|frame| vec![BridgeAction::ClientAudio(frame.into_bytes())])
            .unwrap_or_default()
    }

    pub fn translate_upstream_text(&mut self, text: &str) -> BridgeResult<Vec<BridgeAction>> {
        let event: ServerEvent = serde_json::from_str(text)?;
        let mut actions = Vec::new();

        match event {
            ServerEvent::SessionCreated { session } => {
                info!(upstream_session = %session.id, "Upstream session created");
                actions.push(client(&AgentServerMessage::Welcome {
                    request_id: session.id,
                })?);
            }
            ServerEvent::SessionUpdated { .. } => match self.expected_acks.pop_front() {
                Some(ExpectedAck::Settings) => {
                    let first = !self.handshake.accepted;
                    self.handshake.accepted = true;
                    if first {
                        info!(pending = self.pending.len(), "Upstream accepted settings");
                    }
                    actions.push(client(&AgentServerMessage::SettingsApplied)?);
                    actions.extend(self.release_pending());
                }
                Some(ExpectedAck::Prompt) => {
                    actions.push(client(&AgentServerMessage::PromptUpdated)?)
                }
                Some(ExpectedAck::Speak) => actions.push(client(&AgentServerMessage::SpeakUpdated)?),
                None => debug!("Unsolicited session.updated"),
            },
            ServerEvent::ConversationItemCreated { item, .. } => {
                if let Some(id) = item.id {
                    if self.item_events.values().any(|pending| *pending == id) {
                        debug!(item_id = %id, "Upstream acknowledged item");
                        self.item_events.retain(|_, pending| *pending != id);
                    }
                    self.acknowledged_items.insert(id);
                    actions.extend(self.release_pending());
                }
            }
            ServerEvent::SpeechStarted { audio_start_ms, .. } => {
                debug!(audio_start_ms, "Upstream detected speech");
                actions.push(client(&AgentServerMessage::UserStartedSpeaking)?);
            }
            ServerEvent::SpeechStopped { audio_end_ms, .. } => {
                debug!(audio_end_ms, "Upstream detected end of speech");
            }
            ServerEvent::TranscriptionCompleted { transcript, .. } => {
                actions.push(client(&AgentServerMessage::ConversationText {
                    role: Role::User,
                    content: transcript,
                })?);
            }
            ServerEvent::ResponseCreated { .. } => {
                actions.push(client(&AgentServerMessage::AgentThinking {
                    content: String::new(),
                })?);
            }
            ServerEvent::OutputItemAdded { item, .. } => {
                if item.item_type == "function_call"
                    && let (Some(call_id), Some(name)) = (item.call_id, item.name)
                {
                    self.function_names.insert(call_id, name);
                }
            }
            ServerEvent::AudioDelta {
                response_id, delta, ..
            } => {
                let audio = ServerEvent::decode_audio_delta(&delta)
                    .map_err(|e| BridgeError::InvalidAudio(e.to_string()))?;
                if self.speaking_responses.insert(response_id) {
                    actions.push(client(&AgentServerMessage::AgentStartedSpeaking {
                        total_latency: None,
                        tts_latency: None,
                        ttt_latency: None,
                    })?);
                }
                if let Some(frame) = self.validator.validate(Bytes::from(audio)) {
                    actions.push(BridgeAction::ClientAudio(frame.into_bytes()));
                }
            }
            ServerEvent::AudioDone { .. } => {
                actions.push(client(&AgentServerMessage::AgentAudioDone)?);
            }
            ServerEvent::AudioTranscriptDone { transcript, .. } => {
                actions.push(client(&AgentServerMessage::ConversationText {
                    role: Role::Assistant,
                    content: transcript,
                })?);
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id, arguments, ..
            } => {
                let name = self.function_names.remove(&call_id).unwrap_or_default();
                if name.is_empty() {
                    warn!(%call_id, "Function call without a known name");
                }
                actions.push(client(&AgentServerMessage::FunctionCallRequest {
                    functions: vec![FunctionCallRequest {
                        id: call_id,
                        name,
                        arguments,
                        client_side: true,
                    }],
                })?);
            }
            ServerEvent::ResponseDone { response } => {
                self.speaking_responses.remove(&response.id);
            }
            ServerEvent::Error { error } => {
                warn!(
                    error_type = %error.error_type,
                    code = ?error.code,
                    "Upstream error: {}",
                    error.message
                );
                if let Some(item_id) = error
                    .event_id
                    .as_ref()
                    .and_then(|event_id| self.item_events.remove(event_id))
                {
                    self.failed_items.insert(item_id);
                }
                actions.push(client(&AgentServerMessage::Error {
                    description: error.message,
                    code: error.code.unwrap_or(error.error_type),
                })?);
                actions.extend(self.release_pending());
            }
            ServerEvent::Unknown => return Err(BridgeError::Unsupported(event_type(text))),
        }

        Ok(actions)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Upstream closed. Explains the close to the client if settings were never applied.
    pub fn upstream_closed(&mut self, code: Option<u16>, reason: &str) -> Vec<BridgeAction> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let dropped = self.pending.clear();
        let close_code = forwardable_close_code(code);

        let mut actions = Vec::new();
        if !self.handshake.accepted {
            let code_text = code.map_or_else(|| "none".to_string(), |c| c.to_string());
            warn!(code = %code_text, %reason, dropped, "Upstream closed before settings were applied");
            let description = format!(
                "Upstream closed the connection before settings were applied (code {code_text}, reason: {})",
                if reason.is_empty() { "none" } else { reason }
            );
            match client(&AgentServerMessage::Error {
                description,
                code: UPSTREAM_CLOSED_BEFORE_READY.to_string(),
            }) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Failed to encode close error: {}", e),
            }
        } else {
            info!(?code, %reason, dropped, "Upstream closed");
        }

        actions.push(BridgeAction::CloseClient {
            code: close_code,
            reason: truncate_reason(reason),
        });
        actions
    }

    /// The settings timeout elapsed. Warns the client if upstream has not applied them.
    pub fn settings_timed_out(&mut self) -> Vec<BridgeAction> {
        if self.closed || !self.handshake.sent || self.handshake.accepted {
            return Vec::new();
        }
        error!(
            pending = self.pending.len(),
            "Upstream has not applied settings; client content is still held"
        );
        match client(&AgentServerMessage::Warning {
            description: "Settings not yet applied by upstream; queued messages are held until they are"
                .to_string(),
            code: SETTINGS_NOT_APPLIED.to_string(),
        }) {
            Ok(action) => vec![action],
            Err(e) => {
                warn!("Failed to encode settings warning: {}", e);
                Vec::new()
            }
        }
    }

    /// Client went away: discard everything still pending.
    pub fn client_closed(&mut self) -> usize {
        self.closed = true;
        self.pending.clear()
    }
}

const ITEM_ID_PREFIX: &str = "item_";
const MAX_ITEM_ID_LEN: usize = 32;

/// Client-assigned conversation item id, within the upstream's 32-character limit.
pub fn new_item_id() -> String {
    let mut id = format!("{ITEM_ID_PREFIX}{}", uuid::Uuid::new_v4().simple());
    id.truncate(MAX_ITEM_ID_LEN);
    id
}

/// Upstream audio format name for a client encoding.
fn upstream_audio_format(encoding: &str) -> String {
    match encoding {
        "mulaw" => "g711_ulaw",
        "alaw" => "g711_alaw",
        _ => "pcm16",
    }
    .to_string()
}

/// Close code safe to send to the client for an upstream close `code`.
pub fn forwardable_close_code(code: Option<u16>) -> u16 {
    match code {
        Some(c @ (1000..=1003 | 1007..=1014 | 3000..=4999)) => c,
        _ => CLOSE_INTERNAL_ERROR,
    }
}

/// Close reasons are limited to 123 bytes on the wire.
fn truncate_reason(reason: &str) -> String {
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

fn event_type(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "<untyped>".to_string())
}

fn to_json<T: Serialize>(value: &T) -> BridgeResult<String> {
    Ok(serde_json::to_string(value)?)
}

fn client(message: &AgentServerMessage) -> BridgeResult<BridgeAction> {
    Ok(BridgeAction::Client(to_json(message)?))
}
