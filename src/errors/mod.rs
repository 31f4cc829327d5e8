//! Error types shared across the engine and the relay server.

pub mod agent_error;
pub mod auth_error;
pub mod bridge_error;

pub use agent_error::{AgentError, AgentResult, ErrorDetails};
pub use auth_error::{AuthError, AuthResult};
pub use bridge_error::{BridgeError, BridgeResult};
