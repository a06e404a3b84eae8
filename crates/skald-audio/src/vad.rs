use tracing::debug;
use voice_activity_detector::VoiceActivityDetector;

use crate::error::{AudioError, Result};

/// Silero requires exactly this many samples per inference at 16 kHz.
pub const VAD_WINDOW_SIZE: usize = 512;
pub const VAD_SAMPLE_RATE: u32 = 16_000;

/// Stop scanning further windows once one is this confident.
const EARLY_EXIT_PROB: f32 = 0.9;

/// Neural voice activity detection over arbitrarily sized 16 kHz frames.
///
/// The underlying Silero model scores fixed 512-sample windows; a whole
/// capture chunk is scanned with 50% overlapping windows and the maximum
/// probability wins. The decision threshold belongs to the caller — it
/// changes with playback state.
///
/// The inference session is not safe to share; keep one instance owned by
/// the capture task.
pub struct VoiceDetector {
    model: VoiceActivityDetector,
}

impl VoiceDetector {
    pub fn new() -> Result<Self> {
        let model = VoiceActivityDetector::builder()
            .sample_rate(VAD_SAMPLE_RATE)
            .chunk_size(VAD_WINDOW_SIZE)
            .build()
            .map_err(|e| AudioError::Vad(format!("failed to build VAD model: {}", e)))?;
        debug!(
            "VAD model ready ({} sample windows @ {} Hz)",
            VAD_WINDOW_SIZE, VAD_SAMPLE_RATE
        );
        Ok(Self { model })
    }

    /// Maximum speech probability across 50%-overlapping windows of the
    /// frame. Frames shorter than one window score 0.0.
    pub fn detect_speech(&mut self, samples: &[i16]) -> f32 {
        if samples.len() < VAD_WINDOW_SIZE {
            return 0.0;
        }

        let hop = VAD_WINDOW_SIZE / 2;
        let mut max_prob = 0.0f32;
        let mut start = 0;

        while start + VAD_WINDOW_SIZE <= samples.len() {
            let window = &samples[start..start + VAD_WINDOW_SIZE];
            let prob = self.model.predict(window.iter().copied());
            if prob > max_prob {
                max_prob = prob;
            }
            if prob > EARLY_EXIT_PROB {
                break;
            }
            start += hop;
        }

        max_prob
    }
}
