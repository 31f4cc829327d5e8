pub mod client;
pub mod messages;

pub use client::{
    DEFAULT_LISTEN_URL, ListenOptions, TranscriptionSession, TranscriptionSessionConfig,
};
pub use messages::{ListenControl, ListenEvent};
