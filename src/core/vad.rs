//! Voice activity event sequencing.
//!
//! Vendor notifications arrive from several places (the transcription socket's
//! `SpeechStarted`/`UtteranceEnd`, final results, the agent socket's
//! `UserStartedSpeaking`) and often describe the same physical speech event more
//! than once. The sequencer keeps a monotonic view of whether the user is speaking
//! but re-emits every signal; deduplication is left to the consumer.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Timing attached to an end-of-utterance signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtteranceTiming {
    /// Channel index as reported by the vendor, e.g. `[0, 1]`
    pub channel: Vec<u32>,
    /// End of the last word, in seconds from stream start
    pub last_word_end: f64,
}

/// Raw speech notification from a vendor.
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechSignal {
    Started { channel: Option<u32> },
    Stopped { channel: Option<u32> },
    UtteranceEnded(UtteranceTiming),
}

/// Logical event handed to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    SpeechStarted {
        channel: Option<u32>,
        /// `true` if the user was already speaking (redundant signal)
        redundant: bool,
    },
    SpeechStopped {
        channel: Option<u32>,
        redundant: bool,
        /// Length of the speech span that just ended
        duration: Option<Duration>,
    },
    UtteranceEnded {
        timing: UtteranceTiming,
        redundant: bool,
        duration: Option<Duration>,
    },
}

/// Tracks user speech state across redundant signals.
#[derive(Debug, Default)]
pub struct VadSequencer {
    is_user_speaking: bool,
    speech_started_at: Option<Instant>,
    last_speech_at: Option<Instant>,
}

impl VadSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_user_speaking(&self) -> bool {
        self.is_user_speaking
    }

    /// When speech was last started or stopped.
    pub fn last_speech_at(&self) -> Option<Instant> {
        self.last_speech_at
    }

    /// Duration of the current speech span, if the user is speaking.
    pub fn current_speech_duration(&self) -> Option<Duration> {
        self.speech_started_at
            .filter(|_| self.is_user_speaking)
            .map(|start| start.elapsed())
    }

    /// Apply a signal and return the event to emit. Every signal produces an event.
    pub fn process(&mut self, signal: SpeechSignal) -> VadEvent {
        let now = Instant::now();
        match signal {
            SpeechSignal::Started { channel } => {
                let redundant = self.is_user_speaking;
                if !redundant {
                    self.is_user_speaking = true;
                    self.speech_started_at = Some(now);
                }
                self.last_speech_at = Some(now);
                VadEvent::SpeechStarted { channel, redundant }
            }
            SpeechSignal::Stopped { channel } => {
                let (redundant, duration) = self.stop(now);
                VadEvent::SpeechStopped {
                    channel,
                    redundant,
                    duration,
                }
            }
            SpeechSignal::UtteranceEnded(timing) => {
                let (redundant, duration) = self.stop(now);
                VadEvent::UtteranceEnded {
                    timing,
                    redundant,
                    duration,
                }
            }
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn stop(&mut self, now: Instant) -> (bool, Option<Duration>) {
        if !self.is_user_speaking {
            return (true, None);
        }
        self.is_user_speaking = false;
        self.last_speech_at = Some(now);
        let duration = self
            .speech_started_at
            .take()
            .map(|start| now.duration_since(start));
        (false, duration)
    }
}
