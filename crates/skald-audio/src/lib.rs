pub mod aec;
pub mod device;
pub mod error;
pub mod nlms;
pub mod playback;
pub mod resampler;
pub mod vad;

pub use aec::{EchoCanceller, ReferenceBuffer, ReferenceSink};
pub use device::InputCapture;
pub use error::{AudioError, Result};
pub use playback::{wav_pcm_samples, AudioPlayer, PlaybackHandle, SinkPrograms};
pub use resampler::Resampler;
pub use vad::{VoiceDetector, VAD_SAMPLE_RATE, VAD_WINDOW_SIZE};
