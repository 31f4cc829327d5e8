//! Relay between voice-agent clients and an upstream realtime service.

pub mod pending;
pub mod translator;

pub use pending::{PendingOutboundItem, PendingQueue, Prerequisite, Release};
pub use translator::{
    BridgeAction, BridgeOptions, CLOSE_INTERNAL_ERROR, ProtocolBridge, SETTINGS_NOT_APPLIED,
    UPSTREAM_CLOSED_BEFORE_READY, forwardable_close_code, new_item_id,
};
