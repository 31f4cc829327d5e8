pub mod agent;
pub mod audio;
pub mod bridge;
pub mod connection;
pub mod events;
pub mod readiness;
pub mod router;
pub mod session;
pub mod storage;
pub mod transcription;
pub mod transport;
pub mod upstream;
pub mod vad;

// Re-export commonly used types for convenience
pub use agent::{AgentSession, AgentSessionConfig, Settings, SettingsUpdate};
pub use audio::{AudioFrame, SampleBufferValidator};
pub use bridge::{BridgeAction, BridgeOptions, ProtocolBridge};
pub use connection::{AttemptToken, ConnectionState, ConnectionStateMachine, Service};
pub use events::{
    AgentState, EventCallback, FunctionCallRequest, FunctionCallResponder, PlaybackState,
    SessionEvent, TranscriptUpdate,
};
pub use readiness::{ReadinessGate, ReadyOutcome, SettingsHandshake};
pub use router::{OutboundFrame, OutboundRouter, SendOutcome};
pub use session::{Message, Role, SessionContext};
pub use storage::{MemoryStorage, SessionStorage};
pub use transcription::{ListenOptions, TranscriptionSession, TranscriptionSessionConfig};
pub use transport::Credentials;
pub use vad::{VadEvent, VadSequencer};
