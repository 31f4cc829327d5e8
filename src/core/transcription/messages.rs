//! Transcription (listen) socket messages.

use serde::{Deserialize, Serialize};

/// Control messages sent on the transcription socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ListenControl {
    KeepAlive,
    /// Flush buffered audio and return final results
    Finalize,
    /// Finish the stream; the server closes after sending remaining results
    CloseStream,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultChannel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

/// Messages received on the transcription socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ListenEvent {
    Results {
        #[serde(default)]
        channel_index: Vec<u32>,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
        #[serde(default)]
        channel: ResultChannel,
    },
    SpeechStarted {
        #[serde(default)]
        channel: Vec<u32>,
        #[serde(default)]
        timestamp: f64,
    },
    UtteranceEnd {
        #[serde(default)]
        channel: Vec<u32>,
        #[serde(default)]
        last_word_end: f64,
    },
    Metadata {
        #[serde(default)]
        request_id: String,
    },
    Error {
        #[serde(default)]
        description: String,
        #[serde(default, alias = "variant")]
        code: String,
    },
    #[serde(other)]
    Unknown,
}

/// Event types, for telling control frames apart from audio.
pub const LISTEN_EVENT_TYPES: &[&str] = &[
    "Results",
    "SpeechStarted",
    "UtteranceEnd",
    "Metadata",
    "Error",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_wire_format() {
        assert_eq!(
            serde_json::to_string(&ListenControl::CloseStream).unwrap(),
            r#"{"type":"CloseStream"}"#
        );
    }

    #[test]
    fn test_parse_results() {
        let json = r#"{
            "type": "Results",
            "channel_index": [0, 1],
            "is_final": true,
            "speech_final": true,
            "duration": 1.2,
            "channel": {"alternatives": [{"transcript": "hello there", "confidence": 0.98}]}
        }"#;
        match serde_json::from_str::<ListenEvent>(json).unwrap() {
            ListenEvent::Results {
                channel_index,
                speech_final,
                channel,
                ..
            } => {
                assert_eq!(channel_index, vec![0, 1]);
                assert!(speech_final);
                assert_eq!(channel.alternatives[0].transcript, "hello there");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_utterance_end() {
        let event: ListenEvent =
            serde_json::from_str(r#"{"type":"UtteranceEnd","channel":[0,1],"last_word_end":2.4}"#)
                .unwrap();
        assert_eq!(
            event,
            ListenEvent::UtteranceEnd {
                channel: vec![0, 1],
                last_word_end: 2.4
            }
        );
    }
}
