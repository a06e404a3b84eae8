use thiserror::Error;

pub type Result<T> = std::result::Result<T, AudioError>;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device available")]
    NoInputDevice,

    #[error("Input device not found: {0}")]
    DeviceNotFound(String),

    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Audio format not supported: {0}")]
    UnsupportedFormat(String),

    #[error("Audio stream error: {0}")]
    StreamError(String),

    /// The device stopped delivering data. Fatal: recovery requires
    /// re-enumerating devices, so the process exits for a supervised restart.
    #[error("Audio device stalled: {0}")]
    Stall(String),

    #[error("Capture channel closed: {0}")]
    ChannelClosed(String),

    #[error("VAD error: {0}")]
    Vad(String),

    #[error("Echo canceller error: {0}")]
    Engine(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AudioError {
    /// Whether this error should terminate the process rather than be
    /// retried at the session boundary. Device faults qualify: recovery
    /// needs re-enumeration, which a supervised restart provides.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AudioError::Stall(_)
                | AudioError::NoInputDevice
                | AudioError::DeviceNotFound(_)
                | AudioError::DeviceError(_)
                | AudioError::UnsupportedFormat(_)
                | AudioError::StreamError(_)
        )
    }
}

impl From<cpal::DevicesError> for AudioError {
    fn from(err: cpal::DevicesError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(err: cpal::BuildStreamError) -> Self {
        AudioError::StreamError(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(err: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(err.to_string())
    }
}
