pub mod detector;

pub use detector::{SpeechConfig, SpeechDetector, SpeechEvent, SpeechResult};
