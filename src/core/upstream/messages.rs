//! Upstream realtime protocol events.
//!
//! The relay speaks this protocol to the upstream vendor. Events are JSON objects
//! tagged by a dotted `type`; audio travels base64-encoded inside events.
//!
//! Events the relay sends:
//! - session.update
//! - input_audio_buffer.append
//! - conversation.item.create
//! - response.create / response.cancel
//!
//! Events the relay reacts to:
//! - session.created / session.updated
//! - conversation.item.created
//! - input_audio_buffer.speech_started / speech_stopped
//! - conversation.item.input_audio_transcription.completed
//! - response.created / response.done
//! - response.output_item.added
//! - response.audio.delta / response.audio.done
//! - response.audio_transcript.done
//! - response.function_call_arguments.done
//! - error
//!
//! Anything else deserializes to [`ServerEvent::Unknown`].

use base64::prelude::*;
use serde::{Deserialize, Serialize};

// =============================================================================
// Session Configuration
// =============================================================================

/// Session configuration carried by `session.update`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// System instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputAudioTranscription>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputAudioTranscription {
    /// Transcription model (e.g., "whisper-1")
    pub model: String,
}

/// Turn detection mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    #[serde(rename = "server_vad")]
    ServerVad {
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        create_response: Option<bool>,
    },
    #[serde(rename = "none")]
    None {},
}

impl TurnDetection {
    pub fn server_vad() -> Self {
        TurnDetection::ServerVad {
            threshold: None,
            prefix_padding_ms: None,
            silence_duration_ms: None,
            create_response: Some(true),
        }
    }
}

/// Function tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    /// Always "function"
    #[serde(rename = "type")]
    pub tool_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

// =============================================================================
// Conversation Items
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// message, function_call or function_call_output
    #[serde(rename = "type", default)]
    pub item_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ConversationItem {
    /// A text message from `role` ("user" uses `input_text`, others use `text`).
    pub fn text_message(id: Option<String>, role: &str, text: impl Into<String>) -> Self {
        let content_type = if role == "user" { "input_text" } else { "text" };
        Self {
            id,
            item_type: "message".to_string(),
            role: Some(role.to_string()),
            content: Some(vec![ContentPart {
                content_type: content_type.to_string(),
                text: Some(text.into()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    pub fn function_call_output(
        id: Option<String>,
        call_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            id,
            item_type: "function_call_output".to_string(),
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    /// input_text, input_audio, text or audio
    #[serde(rename = "type", default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 audio
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

/// Per-response overrides for `response.create`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// =============================================================================
// Client Events (sent upstream)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Base64-encoded PCM16
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        item: ConversationItem,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_item_id: Option<String>,
        /// Echoed back in `error.event_id` if the item is rejected
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },

    #[serde(rename = "response.create")]
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<ResponseConfig>,
    },

    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: BASE64_STANDARD.encode(data),
        }
    }

    pub fn item_create(item: ConversationItem) -> Self {
        ClientEvent::ConversationItemCreate {
            item,
            previous_item_id: None,
            event_id: None,
        }
    }

    pub fn response_create() -> Self {
        ClientEvent::ResponseCreate { response: None }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ClientEvent::SessionUpdate { .. } => "session.update",
            ClientEvent::InputAudioBufferAppend { .. } => "input_audio_buffer.append",
            ClientEvent::ConversationItemCreate { .. } => "conversation.item.create",
            ClientEvent::ResponseCreate { .. } => "response.create",
            ClientEvent::ResponseCancel => "response.cancel",
        }
    }
}

// =============================================================================
// Server Events (received from upstream)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        audio_start_ms: u64,
        #[serde(default)]
        item_id: String,
    },

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        audio_end_ms: u64,
        #[serde(default)]
        item_id: String,
    },

    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated {
        #[serde(default)]
        previous_item_id: Option<String>,
        item: ConversationItem,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        item_id: String,
        transcript: String,
    },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        response_id: String,
        item: ConversationItem,
    },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        transcript: String,
    },

    /// Base64-encoded PCM16 chunk
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        delta: String,
    },

    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        call_id: String,
        arguments: String,
    },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn decode_audio_delta(delta: &str) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(delta)
    }
}

// =============================================================================
// Supporting Types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    /// Client event that caused the error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_update_serialization() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig {
                instructions: Some("Be helpful".into()),
                voice: Some("alloy".into()),
                input_audio_format: Some("pcm16".into()),
                turn_detection: Some(TurnDetection::server_vad()),
                ..Default::default()
            },
        };
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session.update");
        assert_eq!(json["session"]["voice"], "alloy");
        assert_eq!(json["session"]["turn_detection"]["type"], "server_vad");
        assert!(json["session"].get("tools").is_none());
    }

    #[test]
    fn test_user_item_shape() {
        let event = ClientEvent::item_create(ConversationItem::text_message(
            Some("item_1".into()),
            "user",
            "hello",
        ));
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "conversation.item.create");
        assert_eq!(json["item"]["id"], "item_1");
        assert_eq!(json["item"]["type"], "message");
        assert_eq!(json["item"]["content"][0]["type"], "input_text");
        assert_eq!(json["item"]["content"][0]["text"], "hello");
    }

    #[test]
    fn test_response_create_is_bare() {
        assert_eq!(
            serde_json::to_string(&ClientEvent::response_create()).unwrap(),
            r#"{"type":"response.create"}"#
        );
    }

    #[test]
    fn test_audio_append_base64() {
        let event = ClientEvent::audio_append(&[0x00, 0x01, 0x02, 0x03]);
        match event {
            ClientEvent::InputAudioBufferAppend { audio } => {
                assert_eq!(
                    ServerEvent::decode_audio_delta(&audio).unwrap(),
                    vec![0, 1, 2, 3]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_minimal_server_events() {
        let event: ServerEvent = serde_json::from_str(r#"{"type":"session.updated"}"#).unwrap();
        assert!(matches!(event, ServerEvent::SessionUpdated { .. }));

        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"conversation.item.created","item":{"id":"item_9","type":"message"}}"#,
        )
        .unwrap();
        match event {
            ServerEvent::ConversationItemCreated { item, .. } => {
                assert_eq!(item.id.as_deref(), Some("item_9"))
            }
            other => panic!("unexpected {other:?}"),
        }

        let event: ServerEvent = serde_json::from_str(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#,
        )
        .unwrap();
        assert!(matches!(event, ServerEvent::Error { error } if error.message == "bad"));
    }

    #[test]
    fn test_unknown_event() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert_eq!(event, ServerEvent::Unknown);
    }
}
