pub mod client;
pub mod messages;

pub use client::{AgentSession, AgentSessionConfig, DEFAULT_AGENT_URL, SettingsUpdate};
pub use messages::{
    AgentClientMessage, AgentContext, AgentServerMessage, AgentSettings, AudioFormat,
    AudioSettings, ContextMessage, FunctionDef, Settings, SpeakSettings, ThinkSettings,
};
