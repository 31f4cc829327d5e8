//! Translation failures inside the protocol bridge.
//!
//! These never cross the session boundary: the bridge logs them and drops the
//! offending message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Frame is not valid JSON or does not match any known message shape
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Well-formed message with no translation
    #[error("Unsupported message type: {0}")]
    Unsupported(String),

    /// Audio payload could not be decoded
    #[error("Invalid audio: {0}")]
    InvalidAudio(String),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
