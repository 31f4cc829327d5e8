//! Upstream realtime protocol spoken by the relay.

pub mod messages;

pub use messages::{ClientEvent, ConversationItem, ServerEvent, SessionConfig};
