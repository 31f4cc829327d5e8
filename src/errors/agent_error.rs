//! Engine-level errors and the structured error surfaced to hosts.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::connection::{ConnectionState, Service};

/// Errors that can occur while driving a realtime session.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Connection to the remote service failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Credentials rejected at the transport layer
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Malformed or out-of-order protocol message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Not connected
    #[error("Not connected")]
    NotConnected,

    /// Illegal connection state transition
    #[error("Invalid state transition for {service}: {from} -> {to}")]
    InvalidTransition {
        service: Service,
        from: ConnectionState,
        to: ConnectionState,
    },

    /// Storage collaborator failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Session was closed while the operation was pending
    #[error("Session closed")]
    Closed,
}

/// Result type for engine operations.
pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::ConnectionFailed(_) => "connection_failed",
            AgentError::AuthenticationFailed(_) => "authentication_failed",
            AgentError::InvalidConfiguration(_) => "invalid_configuration",
            AgentError::WebSocket(_) => "websocket_error",
            AgentError::Protocol(_) => "protocol_error",
            AgentError::Serialization(_) => "serialization_error",
            AgentError::Timeout(_) => "timeout",
            AgentError::NotConnected => "not_connected",
            AgentError::InvalidTransition { .. } => "invalid_transition",
            AgentError::Storage(_) => "storage_error",
            AgentError::Closed => "closed",
        }
    }

    /// Whether the session can keep going after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AgentError::Protocol(_)
                | AgentError::Serialization(_)
                | AgentError::Storage(_)
                | AgentError::Timeout(_)
        )
    }

    /// Convert into the structured form handed to host callbacks.
    pub fn to_details(&self, service: Service) -> ErrorDetails {
        ErrorDetails {
            service,
            code: self.code().to_string(),
            message: self.to_string(),
            details: None,
            recoverable: self.is_recoverable(),
        }
    }
}

/// Structured error delivered to the host instead of a raw error value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Service the error originated from
    pub service: Service,
    /// Machine-readable code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Raw details from the remote side, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// `true` when the session can continue
    pub recoverable: bool,
}

impl ErrorDetails {
    pub fn new(service: Service, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            service,
            code: code.into(),
            message: message.into(),
            details: None,
            recoverable: false,
        }
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));
        assert_eq!(AgentError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_transition_error_display() {
        let err = AgentError::InvalidTransition {
            service: Service::Agent,
            from: ConnectionState::Closed,
            to: ConnectionState::Connected,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition for agent: closed -> connected"
        );
    }

    #[test]
    fn test_details_recoverable_flag() {
        let details = AgentError::Protocol("bad frame".into()).to_details(Service::Agent);
        assert!(details.recoverable);
        assert_eq!(details.code, "protocol_error");

        let details = AgentError::ConnectionFailed("gone".into()).to_details(Service::Transcription);
        assert!(!details.recoverable);
        assert_eq!(details.service, Service::Transcription);
    }
}
