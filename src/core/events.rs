//! Host-facing events and their dispatcher.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::audio::AudioFrame;
use super::connection::{ConnectionState, Service};
use super::router::SendOutcome;
use super::vad::{UtteranceTiming, VadEvent};
use crate::errors::{AgentResult, ErrorDetails};

/// What the remote agent is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    EnteringSleep,
    Sleeping,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Idle => write!(f, "idle"),
            AgentState::Listening => write!(f, "listening"),
            AgentState::Thinking => write!(f, "thinking"),
            AgentState::Speaking => write!(f, "speaking"),
            AgentState::EnteringSleep => write!(f, "entering_sleep"),
            AgentState::Sleeping => write!(f, "sleeping"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    #[default]
    Stopped,
}

/// Why playback changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackReason {
    /// First agent audio of a turn arrived
    AudioStarted,
    /// Agent finished sending audio
    AudioDone,
    /// User started speaking over the agent
    Interrupted,
}

/// Transcript from the transcription socket.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptUpdate {
    pub text: String,
    pub is_final: bool,
    pub speech_final: bool,
    pub confidence: Option<f64>,
    pub channel_index: Vec<u32>,
}

/// Function invocation requested by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallRequest {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
    #[serde(default)]
    pub client_side: bool,
}

/// Closure behind a [`FunctionCallResponder`].
pub type RespondFn = Arc<dyn Fn(String) -> AgentResult<SendOutcome> + Send + Sync>;

/// Sends the result of a requested function call back to the agent.
#[derive(Clone)]
pub struct FunctionCallResponder {
    respond: RespondFn,
}

impl FunctionCallResponder {
    pub fn new(respond: RespondFn) -> Self {
        Self { respond }
    }

    pub fn respond(&self, content: impl Into<String>) -> AgentResult<SendOutcome> {
        (self.respond)(content.into())
    }
}

impl fmt::Debug for FunctionCallResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FunctionCallResponder")
    }
}

/// Everything a session reports to its host.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    ConnectionStateChanged {
        service: Service,
        state: ConnectionState,
    },
    AgentStateChanged(AgentState),
    TranscriptUpdated(TranscriptUpdate),
    /// Assistant text for the current turn
    AgentUtterance(String),
    /// Confirmed user turn text
    UserMessage(String),
    SpeechStarted {
        service: Service,
        channel: Option<u32>,
    },
    SpeechStopped {
        service: Service,
        channel: Option<u32>,
    },
    UtteranceEnded(UtteranceTiming),
    PlaybackStateChanged {
        state: PlaybackState,
        reason: PlaybackReason,
    },
    AgentAudio(AudioFrame),
    FunctionCallRequested {
        request: FunctionCallRequest,
        responder: FunctionCallResponder,
    },
    Warning(ErrorDetails),
    Error(ErrorDetails),
}

impl SessionEvent {
    /// Map a sequenced VAD event from `service` to its host event.
    pub fn from_vad(service: Service, event: VadEvent) -> Self {
        match event {
            VadEvent::SpeechStarted { channel, .. } => {
                SessionEvent::SpeechStarted { service, channel }
            }
            VadEvent::SpeechStopped { channel, .. } => {
                SessionEvent::SpeechStopped { service, channel }
            }
            VadEvent::UtteranceEnded { timing, .. } => SessionEvent::UtteranceEnded(timing),
        }
    }
}

/// Async host callback.
pub type EventCallback =
    Arc<dyn Fn(SessionEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Queues events and dispatches them to the host callback in order.
///
/// `emit` never blocks and never awaits the host; a dispatcher task drains the
/// queue and awaits each callback before the next event.
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    callback: Arc<RwLock<Option<EventCallback>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            callback: Arc::new(RwLock::new(None)),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn set_callback(&self, callback: EventCallback) {
        *self.callback.write() = Some(callback);
    }

    /// Start the dispatcher. Must be called from within a tokio runtime; later calls are no-ops.
    pub fn start(&self) {
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        let callback = self.callback.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let cb = callback.read().clone();
                if let Some(cb) = cb {
                    cb(event).await;
                }
            }
        });
        *self.dispatcher.lock() = Some(handle);
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}

/// Build an [`EventCallback`] that forwards events into a channel.
pub fn channel_callback(tx: mpsc::UnboundedSender<SessionEvent>) -> EventCallback {
    Arc::new(move |event| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(event);
        })
    })
}
