use skald_audio::{AudioPlayer, EchoCanceller, InputCapture, Resampler, VoiceDetector};
use skald_core::config::{AudioConfig, VadConfig};
use skald_net::{send_audio_chunk, send_end_speech, WsSink};
use skald_speech::{SpeechDetector, SpeechEvent};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::gate::PlaybackGate;
use crate::session::SessionError;

/// Consecutive VAD triggers before ducking the speaker volume.
const DUCK_TRIGGER_COUNT: u32 = 3;
/// Consecutive non-triggers before restoring it.
const RESTORE_SILENCE_COUNT: u32 = 5;
const DUCK_PERCENT: u8 = 25;
/// Extra threshold margin while AEC is cancelling playback echo.
const AEC_PLAYBACK_MARGIN: f32 = 0.20;
/// Poll interval while capture is paused by playback (no-AEC mode).
const GATE_POLL: Duration = Duration::from_millis(50);

/// The capture side of a session: read → resample → AEC → VAD → detector
/// → transmit. Lives exactly as long as the session.
pub struct CaptureLoop<'a> {
    audio: &'a AudioConfig,
    vad_config: &'a VadConfig,
    resampler: &'a Resampler,
    vad: &'a mut VoiceDetector,
    detector: Arc<StdMutex<SpeechDetector>>,
    aec: Arc<EchoCanceller>,
    player: AudioPlayer,
    gate: PlaybackGate,

    // Barge-in ducking state
    consecutive_triggers: u32,
    consecutive_silence: u32,
    // Sparse VAD logging: arm above 0.5, log the next drop below 0.3
    vad_log_armed: bool,
}

impl<'a> CaptureLoop<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        audio: &'a AudioConfig,
        vad_config: &'a VadConfig,
        resampler: &'a Resampler,
        vad: &'a mut VoiceDetector,
        detector: Arc<StdMutex<SpeechDetector>>,
        aec: Arc<EchoCanceller>,
        player: AudioPlayer,
        gate: PlaybackGate,
    ) -> Self {
        Self {
            audio,
            vad_config,
            resampler,
            vad,
            detector,
            aec,
            player,
            gate,
            consecutive_triggers: 0,
            consecutive_silence: 0,
            vad_log_armed: false,
        }
    }

    pub async fn run(
        mut self,
        capture: &mut InputCapture,
        sink: &Arc<Mutex<WsSink>>,
    ) -> Result<(), SessionError> {
        if self.aec.is_enabled() {
            info!("Listening for speech (AEC active during playback)");
        } else if self.audio.echo_cancellation {
            info!(
                "Listening for speech (threshold {:.2} -> {:.2} during playback)",
                self.vad_config.threshold, self.audio.vad_threshold_playback
            );
        } else {
            info!("Listening for speech (mic pauses during playback)");
        }

        loop {
            // Legacy policy: without echo cancellation the mic simply
            // pauses while anything is playing
            if !self.audio.echo_cancellation && self.gate.is_set() {
                tokio::time::sleep(GATE_POLL).await;
                continue;
            }

            let raw = capture.read_chunk(self.audio.chunk_size).await?;
            self.process_chunk(&raw, sink).await?;
        }
    }

    async fn process_chunk(
        &mut self,
        raw: &[i16],
        sink: &Arc<Mutex<WsSink>>,
    ) -> Result<(), SessionError> {
        let resampled = self.resampler.resample(raw);

        let is_playing = self.gate.is_set();
        let aec_applied = self.aec.is_active();
        let frame = if aec_applied {
            self.aec.cancel_echo(&resampled)
        } else {
            resampled
        };

        let speech_prob = self.vad.detect_speech(&frame);

        // During playback the threshold rises: moderately when AEC is
        // removing echo, to a near-1.0 safety net when it is not.
        let threshold = if self.audio.echo_cancellation && is_playing {
            if aec_applied {
                self.vad_config.threshold + AEC_PLAYBACK_MARGIN
            } else {
                self.audio.vad_threshold_playback
            }
        } else {
            self.vad_config.threshold
        };
        let is_speech = speech_prob > threshold;

        self.update_ducking(is_playing, is_speech);
        self.log_playback_vad(is_playing, is_speech, speech_prob, threshold, aec_applied);

        let result = {
            let mut detector = self
                .detector
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            detector.process(&frame, is_speech)
        };

        match result.event {
            SpeechEvent::Started | SpeechEvent::Continuing => {
                let mut sink = sink.lock().await;
                for chunk in &result.chunks_to_send {
                    send_audio_chunk(&mut sink, chunk).await?;
                }
            }
            SpeechEvent::Ended => {
                let mut sink = sink.lock().await;
                send_end_speech(&mut sink).await?;
            }
            SpeechEvent::Silence => {}
        }

        Ok(())
    }

    /// Arm ducking only when speech persists, restore only after sustained
    /// silence; volume changes never fire twice in a row.
    fn update_ducking(&mut self, is_playing: bool, is_speech: bool) {
        if is_playing {
            if is_speech {
                self.consecutive_triggers += 1;
                self.consecutive_silence = 0;
                if self.consecutive_triggers == DUCK_TRIGGER_COUNT {
                    self.player.duck_volume(DUCK_PERCENT);
                }
            } else {
                self.consecutive_silence += 1;
                // Let the trigger count decay rather than reset outright
                self.consecutive_triggers = self.consecutive_triggers.saturating_sub(1);
                if self.consecutive_silence == RESTORE_SILENCE_COUNT
                    && self.player.is_volume_ducked()
                {
                    self.player.restore_volume();
                }
            }
        } else if self.consecutive_triggers > 0 || self.consecutive_silence > 0 {
            self.consecutive_triggers = 0;
            self.consecutive_silence = 0;
            if self.player.is_volume_ducked() {
                self.player.restore_volume();
            }
        }
    }

    /// Log VAD behavior during playback without spamming: triggers always
    /// log; otherwise a crossing above 0.5 arms one log line for the next
    /// drop below 0.3.
    fn log_playback_vad(
        &mut self,
        is_playing: bool,
        is_speech: bool,
        speech_prob: f32,
        threshold: f32,
        aec_applied: bool,
    ) {
        if !is_playing {
            return;
        }

        let should_log = if is_speech {
            self.vad_log_armed = true;
            true
        } else if speech_prob > 0.5 {
            self.vad_log_armed = true;
            false
        } else if speech_prob < 0.3 && self.vad_log_armed {
            self.vad_log_armed = false;
            true
        } else {
            false
        };

        if should_log {
            debug!(
                "Playback VAD: {} prob={:.2} thr={:.2} aec={}",
                if is_speech { "triggered" } else { "settled" },
                speech_prob,
                threshold,
                aec_applied
            );
        }
    }
}
