use skald_core::config::VadConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Timing parameters derived from frame duration.
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    /// Frames of audio kept before speech starts
    pub pre_roll_chunks: usize,
    /// Consecutive silent frames before speech is declared over
    pub max_silence_chunks: usize,
    pub chunk_duration_ms: f64,
}

impl SpeechConfig {
    pub fn new(chunk_duration_ms: f64, pre_buffer_ms: f64, silence_duration_ms: f64) -> Self {
        Self {
            pre_roll_chunks: ((pre_buffer_ms / chunk_duration_ms).round() as usize).max(1),
            max_silence_chunks: ((silence_duration_ms / chunk_duration_ms).round() as usize)
                .max(1),
            chunk_duration_ms,
        }
    }

    pub fn from_vad(vad: &VadConfig, chunk_duration_ms: f64) -> Self {
        Self::new(chunk_duration_ms, vad.pre_buffer_ms, vad.silence_duration_ms)
    }
}

/// What the state machine decided for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    /// No speech; the frame went into the pre-roll
    Silence,
    /// Speech just started; pre-roll plus the triggering frame are flushed
    Started,
    /// Speech is ongoing (including the silence grace period)
    Continuing,
    /// Speech ended; carries stats, no audio
    Ended,
}

/// Result of processing one frame.
#[derive(Debug, Clone)]
pub struct SpeechResult {
    pub event: SpeechEvent,
    /// Frames to transmit, in order. On `Started` this is the pre-roll
    /// followed by the current frame; on `Continuing` just the frame.
    pub chunks_to_send: Vec<Vec<i16>>,
    /// Populated on `Ended`
    pub duration: Option<Duration>,
    pub chunks_sent: Option<usize>,
}

impl SpeechResult {
    fn event(event: SpeechEvent) -> Self {
        Self {
            event,
            chunks_to_send: Vec::new(),
            duration: None,
            chunks_sent: None,
        }
    }
}

/// Two-state machine turning per-frame VAD decisions into speech segments.
///
/// While idle, frames accumulate in a bounded pre-roll ring so the start of
/// the first word — already past when the VAD triggers — still gets
/// transmitted. While speaking, silent frames are forgiven up to
/// `max_silence_chunks` before the utterance is closed.
pub struct SpeechDetector {
    config: SpeechConfig,
    pre_roll: VecDeque<Vec<i16>>,
    speaking: bool,
    silence_streak: usize,
    chunks_sent: usize,
    speech_started_at: Option<Instant>,
    /// Kept after `Ended` for time-to-first-audio measurement
    last_speech_ended_at: Option<Instant>,
}

impl SpeechDetector {
    pub fn new(config: SpeechConfig) -> Self {
        let pre_roll = VecDeque::with_capacity(config.pre_roll_chunks);
        Self {
            config,
            pre_roll,
            speaking: false,
            silence_streak: 0,
            chunks_sent: 0,
            speech_started_at: None,
            last_speech_ended_at: None,
        }
    }

    pub fn config(&self) -> &SpeechConfig {
        &self.config
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// When the last utterance ended, for TTFA measurement.
    pub fn last_speech_ended_at(&self) -> Option<Instant> {
        self.last_speech_ended_at
    }

    /// Clear the end-of-speech timestamp once TTFA has been reported.
    pub fn clear_speech_end(&mut self) {
        self.last_speech_ended_at = None;
    }

    pub fn process(&mut self, frame: &[i16], is_speech: bool) -> SpeechResult {
        if self.speaking {
            self.process_speaking(frame, is_speech)
        } else {
            self.process_idle(frame, is_speech)
        }
    }

    fn process_idle(&mut self, frame: &[i16], is_speech: bool) -> SpeechResult {
        if !is_speech {
            if self.pre_roll.len() == self.config.pre_roll_chunks {
                self.pre_roll.pop_front();
            }
            self.pre_roll.push_back(frame.to_vec());
            return SpeechResult::event(SpeechEvent::Silence);
        }

        self.speaking = true;
        self.silence_streak = 0;
        self.speech_started_at = Some(Instant::now());

        let mut chunks_to_send: Vec<Vec<i16>> = self.pre_roll.drain(..).collect();
        chunks_to_send.push(frame.to_vec());
        self.chunks_sent = chunks_to_send.len();

        info!("Speech started ({} pre-roll frames)", chunks_to_send.len() - 1);

        SpeechResult {
            event: SpeechEvent::Started,
            chunks_to_send,
            duration: None,
            chunks_sent: None,
        }
    }

    fn process_speaking(&mut self, frame: &[i16], is_speech: bool) -> SpeechResult {
        if is_speech {
            self.silence_streak = 0;
            self.chunks_sent += 1;
            return SpeechResult {
                event: SpeechEvent::Continuing,
                chunks_to_send: vec![frame.to_vec()],
                duration: None,
                chunks_sent: None,
            };
        }

        self.silence_streak += 1;
        if self.silence_streak < self.config.max_silence_chunks {
            // Grace period: the pause may be mid-sentence, keep sending
            self.chunks_sent += 1;
            return SpeechResult {
                event: SpeechEvent::Continuing,
                chunks_to_send: vec![frame.to_vec()],
                duration: None,
                chunks_sent: None,
            };
        }

        let duration = self.speech_started_at.map(|t| t.elapsed());
        let chunks_sent = self.chunks_sent;

        self.speaking = false;
        self.silence_streak = 0;
        self.chunks_sent = 0;
        self.speech_started_at = None;
        self.last_speech_ended_at = Some(Instant::now());

        match duration {
            Some(d) => info!("Speech ended: {:.1}s, {} chunks sent", d.as_secs_f64(), chunks_sent),
            None => debug!("Speech ended: {} chunks sent", chunks_sent),
        }

        SpeechResult {
            event: SpeechEvent::Ended,
            chunks_to_send: Vec::new(),
            duration,
            chunks_sent: Some(chunks_sent),
        }
    }

    /// Drop all state and buffers (used between sessions).
    pub fn reset(&mut self) {
        self.pre_roll.clear();
        self.speaking = false;
        self.silence_streak = 0;
        self.chunks_sent = 0;
        self.speech_started_at = None;
        self.last_speech_ended_at = None;
    }
}
