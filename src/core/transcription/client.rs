//! Streaming transcription session.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::messages::{LISTEN_EVENT_TYPES, ListenControl, ListenEvent};
use crate::core::audio::{FrameKind, SampleBufferValidator, classify_binary};
use crate::core::connection::{AttemptToken, ConnectionState, Service};
use crate::core::events::{EventCallback, EventEmitter, SessionEvent, TranscriptUpdate};
use crate::core::router::SendOutcome;
use crate::core::transport::{
    Credentials, InboundFrame, InboundStream, ServiceConnection, abnormal_close,
};
use crate::core::vad::{SpeechSignal, UtteranceTiming, VadSequencer};
use crate::errors::{AgentError, AgentResult, ErrorDetails};

/// Default transcription endpoint.
pub const DEFAULT_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Query options for the transcription socket.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenOptions {
    pub model: Option<String>,
    pub language: Option<String>,
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u32,
    pub interim_results: bool,
    /// Emit `SpeechStarted` events
    pub vad_events: bool,
    /// Silence gap that ends an utterance, in milliseconds
    pub utterance_end_ms: Option<u32>,
    pub endpointing: Option<u32>,
    pub smart_format: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            model: Some("nova-3".to_string()),
            language: None,
            encoding: "linear16".to_string(),
            sample_rate: 16000,
            channels: 1,
            interim_results: true,
            vad_events: true,
            utterance_end_ms: Some(1000),
            endpointing: None,
            smart_format: true,
        }
    }
}

impl ListenOptions {
    /// Endpoint URL with these options as query parameters.
    pub fn build_url(&self, endpoint: &str) -> AgentResult<String> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| AgentError::InvalidConfiguration(format!("Invalid endpoint: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(model) = &self.model {
                query.append_pair("model", model);
            }
            if let Some(language) = &self.language {
                query.append_pair("language", language);
            }
            query.append_pair("encoding", &self.encoding);
            query.append_pair("sample_rate", &self.sample_rate.to_string());
            query.append_pair("channels", &self.channels.to_string());
            query.append_pair("interim_results", &self.interim_results.to_string());
            query.append_pair("vad_events", &self.vad_events.to_string());
            query.append_pair("smart_format", &self.smart_format.to_string());
            if let Some(ms) = self.utterance_end_ms {
                query.append_pair("utterance_end_ms", &ms.to_string());
            }
            if let Some(ms) = self.endpointing {
                query.append_pair("endpointing", &ms.to_string());
            }
        }
        Ok(url.into())
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptionSessionConfig {
    pub endpoint: String,
    pub credentials: Credentials,
    pub options: ListenOptions,
    pub connect_timeout: Duration,
}

impl Default for TranscriptionSessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_LISTEN_URL.to_string(),
            credentials: Credentials::None,
            options: ListenOptions::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct TranscriptionInner {
    config: TranscriptionSessionConfig,
    connection: ServiceConnection,
    emitter: Arc<EventEmitter>,
    validator: SampleBufferValidator,
    vad: Mutex<VadSequencer>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Client session for the transcription socket.
#[derive(Clone)]
pub struct TranscriptionSession {
    inner: Arc<TranscriptionInner>,
}

impl TranscriptionSession {
    pub fn new(config: TranscriptionSessionConfig) -> Self {
        let connection = ServiceConnection::new(Service::Transcription);
        let emitter = Arc::new(EventEmitter::new());
        {
            let emitter = emitter.clone();
            connection.machine().subscribe(Arc::new(move |service, state| {
                emitter.emit(SessionEvent::ConnectionStateChanged { service, state });
            }));
        }

        Self {
            inner: Arc::new(TranscriptionInner {
                config,
                connection,
                emitter,
                validator: SampleBufferValidator::new(),
                vad: Mutex::new(VadSequencer::new()),
                reader: Mutex::new(None),
            }),
        }
    }

    pub fn on_event(&self, callback: EventCallback) {
        self.inner.emitter.set_callback(callback);
    }

    pub async fn connect(&self) -> AgentResult<AttemptToken> {
        let inner = &self.inner;
        inner.emitter.start();

        let url = inner.config.options.build_url(&inner.config.endpoint)?;
        let stream = match inner
            .connection
            .open(&url, &inner.config.credentials, inner.config.connect_timeout)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                inner
                    .emitter
                    .emit(SessionEvent::Error(e.to_details(Service::Transcription)));
                return Err(e);
            }
        };

        let attempt = stream.attempt();
        inner.vad.lock().reset();
        let reader = tokio::spawn(Self::run_reader(Arc::downgrade(inner), stream));
        if let Some(previous) = inner.reader.lock().replace(reader) {
            previous.abort();
        }
        info!(%attempt, "Transcription session connected");
        Ok(attempt)
    }

    /// Send microphone audio. Odd-length buffers are repaired; empty ones are skipped.
    pub fn send_audio(&self, data: Bytes) -> SendOutcome {
        match self.inner.validator.validate(data) {
            Some(frame) => self.inner.connection.send_binary(frame.into_bytes()),
            None => SendOutcome::NotSent,
        }
    }

    pub fn keep_alive(&self) -> AgentResult<SendOutcome> {
        self.send_control(&ListenControl::KeepAlive)
    }

    /// Ask the server to flush buffered audio as final results.
    pub fn finalize(&self) -> AgentResult<SendOutcome> {
        self.send_control(&ListenControl::Finalize)
    }

    /// Tell the server no more audio is coming. The server closes the socket
    /// after delivering remaining results.
    pub fn close_stream(&self) -> AgentResult<SendOutcome> {
        self.send_control(&ListenControl::CloseStream)
    }

    pub fn close(&self) {
        let inner = &self.inner;
        if inner.connection.close() {
            info!("Transcription session closed");
        }
        if let Some(handle) = inner.reader.lock().take() {
            handle.abort();
        }
        inner.vad.lock().reset();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn is_user_speaking(&self) -> bool {
        self.inner.vad.lock().is_user_speaking()
    }

    fn send_control(&self, message: &ListenControl) -> AgentResult<SendOutcome> {
        if self.inner.connection.state() != ConnectionState::Connected {
            return Err(AgentError::NotConnected);
        }
        let json = serde_json::to_string(message)?;
        Ok(self.inner.connection.send_text(json))
    }

    async fn run_reader(weak: Weak<TranscriptionInner>, mut stream: InboundStream) {
        let attempt = stream.attempt();
        while let Some(frame) = stream.next_frame().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let session = TranscriptionSession { inner };
            match frame {
                InboundFrame::Text(text) => session.handle_text(&text),
                InboundFrame::Binary(data) => {
                    if let FrameKind::Control(text) = classify_binary(&data, LISTEN_EVENT_TYPES) {
                        session.handle_text(&text);
                    } else {
                        debug!(bytes = data.len(), "Ignoring binary frame on transcription socket");
                    }
                }
                InboundFrame::Closed { code, reason } => {
                    info!(?code, %reason, %attempt, "Transcription socket closed by server");
                    if session.inner.connection.transport_ended(attempt, false)
                        && let Some(details) =
                            abnormal_close(Service::Transcription, code, &reason)
                    {
                        session.inner.emitter.emit(SessionEvent::Error(details));
                    }
                }
                InboundFrame::Failed(e) => {
                    warn!(%attempt, "Transcription socket failed: {}", e);
                    if session.inner.connection.transport_ended(attempt, true) {
                        session.inner.emitter.emit(SessionEvent::Error(
                            AgentError::WebSocket(e).to_details(Service::Transcription),
                        ));
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let event = match serde_json::from_str::<ListenEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping malformed transcription message: {}", e);
                return;
            }
        };
        let inner = &self.inner;

        match event {
            ListenEvent::Results {
                channel_index,
                is_final,
                speech_final,
                channel,
            } => {
                let first_channel = channel_index.first().copied();
                if let Some(best) = channel.alternatives.into_iter().next()
                    && !best.transcript.is_empty()
                {
                    inner
                        .emitter
                        .emit(SessionEvent::TranscriptUpdated(TranscriptUpdate {
                            text: best.transcript,
                            is_final,
                            speech_final,
                            confidence: best.confidence,
                            channel_index,
                        }));
                }
                if speech_final {
                    self.process_vad(SpeechSignal::Stopped {
                        channel: first_channel,
                    });
                }
            }
            ListenEvent::SpeechStarted { channel, timestamp } => {
                debug!(timestamp, "Speech started");
                self.process_vad(SpeechSignal::Started {
                    channel: channel.first().copied(),
                });
            }
            ListenEvent::UtteranceEnd {
                channel,
                last_word_end,
            } => {
                self.process_vad(SpeechSignal::UtteranceEnded(UtteranceTiming {
                    channel,
                    last_word_end,
                }));
            }
            ListenEvent::Metadata { request_id } => {
                debug!(%request_id, "Transcription metadata");
            }
            ListenEvent::Error { description, code } => {
                error!(%code, "Transcription error: {}", description);
                inner.emitter.emit(SessionEvent::Error(ErrorDetails::new(
                    Service::Transcription,
                    code,
                    description,
                )));
            }
            ListenEvent::Unknown => debug!("Ignoring unknown transcription message"),
        }
    }

    fn process_vad(&self, signal: SpeechSignal) {
        let event = self.inner.vad.lock().process(signal);
        self.inner
            .emitter
            .emit(SessionEvent::from_vad(Service::Transcription, event));
    }
}

impl Drop for TranscriptionInner {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.connection.close();
    }
}
