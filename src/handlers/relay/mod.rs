//! Voice-agent relay WebSocket handler
//!
//! Clients speak the voice-agent protocol; the relay speaks the upstream realtime
//! protocol on their behalf.
//!
//! ## Client → Relay
//!
//! - **Settings**, **UpdatePrompt**, **UpdateSpeak**
//! - **InjectUserMessage**, **InjectAgentMessage**, **FunctionCallResponse**
//! - **KeepAlive**
//! - **Binary frames**: PCM16 audio
//!
//! ## Relay → Client
//!
//! - **Welcome**, **SettingsApplied**, **PromptUpdated**, **SpeakUpdated**
//! - **ConversationText**, **UserStartedSpeaking**, **AgentThinking**
//! - **AgentStartedSpeaking**, **AgentAudioDone**, **FunctionCallRequest**
//! - **Error** / **Warning**
//! - **Binary frames**: PCM16 agent audio

mod handler;

pub use handler::relay_handler;
