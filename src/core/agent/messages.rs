//! Voice-agent protocol messages.
//!
//! JSON text frames tagged by `type`, plus binary PCM16 audio.
//!
//! Client messages:
//! - `Settings` - Session configuration, sent once per connection
//! - `UpdatePrompt` / `UpdateSpeak` - Change instructions or voice mid-session
//! - `InjectUserMessage` / `InjectAgentMessage` - Text turns
//! - `FunctionCallResponse` - Result of a client-side function
//! - `KeepAlive`
//!
//! Server messages:
//! - `Welcome` - Connection greeting
//! - `SettingsApplied` - Configuration accepted
//! - `ConversationText` - Confirmed turn text
//! - `UserStartedSpeaking`, `AgentThinking`, `AgentStartedSpeaking`, `AgentAudioDone`
//! - `FunctionCallRequest`
//! - `Error` / `Warning`

use serde::{Deserialize, Serialize};

use crate::core::events::FunctionCallRequest;
use crate::core::session::{Message, Role};

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            encoding: "linear16".to_string(),
            sample_rate: 24000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    #[serde(default)]
    pub input: AudioFormat,
    #[serde(default)]
    pub output: AudioFormat,
}

/// Function the agent may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThinkSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Vec<FunctionDef>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeakSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for ContextMessage {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
        }
    }
}

/// Prior conversation handed to the agent on (re)connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    #[serde(default)]
    pub messages: Vec<ContextMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<serde_json::Value>,
    #[serde(default)]
    pub think: ThinkSettings,
    #[serde(default)]
    pub speak: SpeakSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<AgentContext>,
}

/// Session configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub audio: AudioSettings,
    #[serde(default)]
    pub agent: AgentSettings,
}

impl Settings {
    /// Copy of these settings carrying `history` as agent context.
    ///
    /// Existing context messages are kept; history is appended after them.
    pub fn with_history(&self, history: &[Message]) -> Settings {
        let mut settings = self.clone();
        if history.is_empty() {
            return settings;
        }
        let context = settings.agent.context.get_or_insert_with(AgentContext::default);
        context
            .messages
            .extend(history.iter().map(ContextMessage::from));
        settings
    }

    /// Settings with context stripped, used for change detection.
    pub fn without_context(&self) -> Settings {
        let mut settings = self.clone();
        settings.agent.context = None;
        settings
    }
}

// =============================================================================
// Client Messages
// =============================================================================

/// Messages sent from the client to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentClientMessage {
    Settings(Settings),
    UpdatePrompt {
        prompt: String,
    },
    UpdateSpeak {
        speak: SpeakSettings,
    },
    InjectUserMessage {
        content: String,
    },
    InjectAgentMessage {
        message: String,
    },
    FunctionCallResponse {
        id: String,
        name: String,
        content: String,
    },
    KeepAlive,
}

impl AgentClientMessage {
    /// Whether this message carries conversational content and must wait for settings.
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            AgentClientMessage::InjectUserMessage { .. }
                | AgentClientMessage::InjectAgentMessage { .. }
                | AgentClientMessage::FunctionCallResponse { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            AgentClientMessage::Settings(_) => "Settings",
            AgentClientMessage::UpdatePrompt { .. } => "UpdatePrompt",
            AgentClientMessage::UpdateSpeak { .. } => "UpdateSpeak",
            AgentClientMessage::InjectUserMessage { .. } => "InjectUserMessage",
            AgentClientMessage::InjectAgentMessage { .. } => "InjectAgentMessage",
            AgentClientMessage::FunctionCallResponse { .. } => "FunctionCallResponse",
            AgentClientMessage::KeepAlive => "KeepAlive",
        }
    }
}

/// Client message types, for telling control frames apart from audio.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "Settings",
    "UpdatePrompt",
    "UpdateSpeak",
    "InjectUserMessage",
    "InjectAgentMessage",
    "FunctionCallResponse",
    "KeepAlive",
];

// =============================================================================
// Server Messages
// =============================================================================

/// Messages sent from the agent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentServerMessage {
    Welcome {
        #[serde(default)]
        request_id: String,
    },
    SettingsApplied,
    PromptUpdated,
    SpeakUpdated,
    ConversationText {
        role: Role,
        content: String,
    },
    UserStartedSpeaking,
    AgentThinking {
        #[serde(default)]
        content: String,
    },
    AgentStartedSpeaking {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_latency: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tts_latency: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttt_latency: Option<f64>,
    },
    AgentAudioDone,
    FunctionCallRequest {
        functions: Vec<FunctionCallRequest>,
    },
    Error {
        #[serde(default)]
        description: String,
        #[serde(default)]
        code: String,
    },
    Warning {
        #[serde(default)]
        description: String,
        #[serde(default)]
        code: String,
    },
    /// Any message type this client does not know
    #[serde(other)]
    Unknown,
}

/// Server message types, for telling control frames apart from audio.
pub const SERVER_MESSAGE_TYPES: &[&str] = &[
    "Welcome",
    "SettingsApplied",
    "PromptUpdated",
    "SpeakUpdated",
    "ConversationText",
    "UserStartedSpeaking",
    "AgentThinking",
    "AgentStartedSpeaking",
    "AgentAudioDone",
    "FunctionCallRequest",
    "Error",
    "Warning",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_wire_format() {
        let msg = AgentClientMessage::Settings(Settings {
            agent: AgentSettings {
                language: Some("en".into()),
                think: ThinkSettings {
                    prompt: Some("Be brief.".into()),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Settings");
        assert_eq!(json["audio"]["input"]["encoding"], "linear16");
        assert_eq!(json["agent"]["think"]["prompt"], "Be brief.");
        assert!(json["agent"].get("context").is_none());
    }

    #[test]
    fn test_parse_client_messages() {
        let msg: AgentClientMessage =
            serde_json::from_str(r#"{"type":"InjectUserMessage","content":"hello"}"#).unwrap();
        assert!(msg.is_content());
        assert_eq!(msg.type_name(), "InjectUserMessage");

        let msg: AgentClientMessage = serde_json::from_str(r#"{"type":"KeepAlive"}"#).unwrap();
        assert_eq!(msg, AgentClientMessage::KeepAlive);
        assert!(!msg.is_content());
    }

    #[test]
    fn test_parse_server_messages() {
        let msg: AgentServerMessage =
            serde_json::from_str(r#"{"type":"SettingsApplied"}"#).unwrap();
        assert_eq!(msg, AgentServerMessage::SettingsApplied);

        let msg: AgentServerMessage = serde_json::from_str(
            r#"{"type":"ConversationText","role":"assistant","content":"Hi!"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            AgentServerMessage::ConversationText {
                role: Role::Assistant,
                content: "Hi!".into()
            }
        );

        let msg: AgentServerMessage = serde_json::from_str(
            r#"{"type":"FunctionCallRequest","functions":[{"id":"f1","name":"lookup","arguments":"{}","client_side":true}]}"#,
        )
        .unwrap();
        match msg {
            AgentServerMessage::FunctionCallRequest { functions } => {
                assert_eq!(functions[0].name, "lookup");
                assert!(functions[0].client_side);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_server_type() {
        let msg: AgentServerMessage =
            serde_json::from_str(r#"{"type":"History","role":"user"}"#).unwrap();
        assert_eq!(msg, AgentServerMessage::Unknown);
    }

    #[test]
    fn test_with_history_appends_context() {
        let settings = Settings::default();
        let history = vec![
            Message::new(Role::User, "my name is Ada"),
            Message::new(Role::Assistant, "nice to meet you"),
        ];
        let with = settings.with_history(&history);
        let context = with.agent.context.as_ref().unwrap();
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[0].role, Role::User);
        assert_eq!(with.without_context(), settings);
        assert_eq!(settings.with_history(&[]), settings);
    }
}
