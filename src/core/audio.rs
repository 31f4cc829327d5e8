//! PCM16 frame validation and binary frame classification.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Bytes per PCM16 sample.
pub const BYTES_PER_SAMPLE: usize = 2;

/// A validated PCM16 little-endian mono frame. Length is always even and non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Bytes,
}

impl AudioFrame {
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn sample_count(&self) -> usize {
        self.data.len() / BYTES_PER_SAMPLE
    }

    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }

    /// Samples scaled to `[-1.0, 1.0)` for playback buffers.
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples()
            .map(|sample| sample as f32 * (1.0 / 32768.0))
            .collect()
    }
}

/// Repairs raw audio chunks into [`AudioFrame`]s.
///
/// Odd-length chunks lose their trailing byte instead of being rejected.
#[derive(Debug, Default)]
pub struct SampleBufferValidator {
    truncations: AtomicU64,
}

impl SampleBufferValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a chunk. Returns `None` when nothing playable is left.
    pub fn validate(&self, mut buffer: Bytes) -> Option<AudioFrame> {
        if buffer.len() % BYTES_PER_SAMPLE != 0 {
            let total = self.truncations.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                length = buffer.len(),
                truncations = total,
                "Odd-length PCM16 buffer, dropping trailing byte"
            );
            buffer.truncate(buffer.len() - 1);
        }
        if buffer.is_empty() {
            return None;
        }
        Some(AudioFrame { data: buffer })
    }

    /// Number of buffers repaired so far.
    pub fn truncations(&self) -> u64 {
        self.truncations.load(Ordering::Relaxed)
    }
}

/// What a binary frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameKind {
    /// JSON control message carried in a binary frame
    Control(String),
    Audio(Bytes),
}

/// Classify a binary frame.
///
/// Only frames that decode as UTF-8 JSON objects with a `type` listed in
/// `known_types` count as control; everything else is audio.
pub fn classify_binary(data: &Bytes, known_types: &[&str]) -> FrameKind {
    let first = data.iter().find(|b| !b.is_ascii_whitespace());
    if first != Some(&b'{') {
        return FrameKind::Audio(data.clone());
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return FrameKind::Audio(data.clone());
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return FrameKind::Audio(data.clone());
    };
    match value.get("type").and_then(|t| t.as_str()) {
        Some(kind) if known_types.contains(&kind) => FrameKind::Control(text.to_string()),
        _ => FrameKind::Audio(data.clone()),
    }
}
