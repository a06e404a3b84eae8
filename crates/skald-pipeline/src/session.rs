use skald_audio::{AudioError, AudioPlayer, EchoCanceller, InputCapture, Resampler, VoiceDetector};
use skald_core::cache::AudioCache;
use skald_core::config::AppConfig;
use skald_net::{NetError, ServerConnection, WsSink};
use skald_speech::{SpeechConfig, SpeechDetector};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::capture::CaptureLoop;
use crate::dispatch::Dispatcher;
use crate::gate::PlaybackGate;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Net(#[from] NetError),
}

impl SessionError {
    /// Fatal errors exit the process; everything else retries at the
    /// session boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Audio(e) if e.is_fatal())
    }
}

/// Owns every long-lived component and runs the connect/session/reconnect
/// loop. One session per successful connect; per-session state (gate,
/// dispatch bookkeeping, capture stream) is rebuilt each time.
pub struct Coordinator {
    config: AppConfig,
    resampler: Resampler,
    vad: VoiceDetector,
    detector: Arc<StdMutex<SpeechDetector>>,
    aec: Arc<EchoCanceller>,
    player: AudioPlayer,
    cache: AudioCache,
}

impl Coordinator {
    pub fn new(config: AppConfig) -> Result<Self, CoordinatorSetupError> {
        let resampler = Resampler::new(config.audio.capture_rate, config.audio.target_rate);
        let vad = VoiceDetector::new().map_err(CoordinatorSetupError::Vad)?;

        let chunk_ms = config.audio.chunk_duration_ms();
        let detector = Arc::new(StdMutex::new(SpeechDetector::new(SpeechConfig::from_vad(
            &config.vad,
            chunk_ms,
        ))));

        let aec = Arc::new(EchoCanceller::new(
            config.aec.clone(),
            config.audio.target_rate,
        ));
        let player = AudioPlayer::new(aec.clone(), Duration::from_secs(30));
        let cache = AudioCache::open(&config.cache).map_err(CoordinatorSetupError::Cache)?;

        // Probe the input device now so a missing microphone fails startup
        // instead of looping through reconnect attempts
        drop(InputCapture::open(&config.audio).map_err(CoordinatorSetupError::Device)?);

        Ok(Self {
            config,
            resampler,
            vad,
            detector,
            aec,
            player,
            cache,
        })
    }

    /// Run until a fatal error. Transport failures reset the detector and
    /// retry after the configured delay.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        let connection = ServerConnection::new(self.config.server.ws_url());
        let reconnect_delay = Duration::from_secs_f64(self.config.network.reconnect_delay);

        loop {
            match self.run_session(&connection).await {
                Ok(()) => info!("Session closed by server"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Session error: {}", e),
            }

            // Reset before sleeping so reconnect logs are not polluted
            // with stale counters
            self.detector
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .reset();

            info!(
                "Reconnecting in {:.0}s...",
                reconnect_delay.as_secs_f64()
            );
            tokio::time::sleep(reconnect_delay).await;
        }
    }

    async fn run_session(&mut self, connection: &ServerConnection) -> Result<(), SessionError> {
        let (sink, mut source) = connection.connect().await?;
        let sink: Arc<Mutex<WsSink>> = Arc::new(Mutex::new(sink));

        // Fresh per-session state
        let gate = PlaybackGate::new();
        let mut capture = InputCapture::open(&self.config.audio)?;

        let capture_loop = CaptureLoop::new(
            &self.config.audio,
            &self.config.vad,
            &self.resampler,
            &mut self.vad,
            Arc::clone(&self.detector),
            Arc::clone(&self.aec),
            self.player.clone(),
            gate.clone(),
        );

        let dispatcher = Dispatcher::new(
            self.player.clone(),
            &mut self.cache,
            Arc::clone(&self.detector),
            Arc::clone(&self.aec),
            gate.clone(),
            Arc::clone(&sink),
        );

        // Two concurrent loops; whichever finishes first ends the session
        // and cancels the other.
        let result = tokio::select! {
            r = capture_loop.run(&mut capture, &sink) => r,
            r = dispatcher.run(&mut source) => r,
        };

        capture.close();
        self.player.stop_current();
        result
    }
}

/// Startup failures that should exit the process with a non-zero code.
#[derive(Error, Debug)]
pub enum CoordinatorSetupError {
    #[error("VAD model unavailable: {0}")]
    Vad(AudioError),

    #[error("Cache unavailable: {0}")]
    Cache(skald_core::SkaldError),

    #[error("Input device unavailable: {0}")]
    Device(AudioError),
}
