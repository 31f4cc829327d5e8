pub mod config;
pub mod core;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

// Re-export commonly used items for convenience
pub use config::ServerConfig;
pub use core::*;
pub use errors::{AgentError, AgentResult, AuthError, AuthResult, BridgeError, BridgeResult};
pub use routes::create_app;
pub use state::AppState;
