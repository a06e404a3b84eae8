//! Time-synchronized acoustic echo cancellation.
//!
//! The client already has the perfect reference signal — the PCM it hands to
//! the speaker. The hard part is time alignment: matching what the mic hears
//! now to what was playing `speaker_to_mic_delay_ms` ago. The reference ring
//! buffer tracks when playback started and addresses reads by elapsed
//! wall-clock time, which makes whole-file WAV playback (registered upfront,
//! rendered in real time) line up with live capture.
//!
//! Registration is two-phased: `begin_registration` resets the ring for the
//! next utterance, `start_playback` latches the wall clock at the moment the
//! sink is actually commanded. Streaming playback latches on its first chunk
//! instead (`auto_start`). Conflating the two drifts across concatenated
//! sentences.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use skald_core::config::AecConfig;
use tracing::{debug, warn};

use crate::nlms::FrameCanceller;
use crate::resampler::Resampler;

/// Result of addressing the reference ring at a playback offset.
pub enum ReferenceRead {
    /// No playback timing is latched
    Inactive,
    /// The acoustic path has not reached the mic yet: zero reference
    Pending(Vec<i16>),
    /// The offset is past everything registered: playback exhausted
    Exhausted,
    Frame(Vec<i16>),
}

/// Circular int16 buffer of rendered audio with playback time tracking.
pub struct ReferenceBuffer {
    samples: Vec<i16>,
    capacity: usize,
    sample_rate: u32,
    write_pos: usize,
    total_written: u64,
    /// Non-null iff playback is in progress
    playback_start: Option<Instant>,
    /// Value of `total_written` when playback began
    playback_start_sample: u64,
    /// Snapshot taken just before a new registration begins
    pending_start_sample: u64,
}

impl ReferenceBuffer {
    pub fn new(capacity: usize, sample_rate: u32) -> Self {
        Self {
            samples: vec![0; capacity],
            capacity,
            sample_rate,
            write_pos: 0,
            total_written: 0,
            playback_start: None,
            playback_start_sample: 0,
            pending_start_sample: 0,
        }
    }

    /// Reset the ring for a new playback registration. Each utterance gets
    /// fresh timing from position 0. Playback timing is NOT touched here —
    /// a previous playback may still be draining and must stay cancellable.
    pub fn begin_registration(&mut self) {
        self.samples.fill(0);
        self.write_pos = 0;
        self.total_written = 0;
        self.pending_start_sample = 0;
    }

    /// Latch the wall clock: audio is being handed to the sink now.
    pub fn start_playback(&mut self) {
        self.playback_start = Some(Instant::now());
        self.playback_start_sample = self.pending_start_sample;
    }

    pub fn end_playback(&mut self) {
        self.playback_start = None;
    }

    pub fn is_playing(&self) -> bool {
        self.playback_start.is_some()
    }

    /// Samples that should have been rendered since playback started,
    /// according to the monotonic clock. None when playback is not timed.
    pub fn elapsed_samples(&self) -> Option<i64> {
        self.playback_start
            .map(|t0| (t0.elapsed().as_secs_f64() * self.sample_rate as f64) as i64)
    }

    /// Append samples, wrapping around the ring as needed.
    pub fn write(&mut self, samples: &[i16]) {
        let mut samples = samples;
        if samples.is_empty() {
            return;
        }
        if samples.len() >= self.capacity {
            // Only the newest capacity-worth survives; account for the
            // skipped prefix so logical positions keep mapping to
            // `position % capacity`
            let skip = samples.len() - self.capacity;
            self.write_pos = (self.write_pos + skip) % self.capacity;
            self.total_written += skip as u64;
            samples = &samples[skip..];
        }

        let n = samples.len();
        let space_at_end = self.capacity - self.write_pos;
        if n <= space_at_end {
            self.samples[self.write_pos..self.write_pos + n].copy_from_slice(samples);
        } else {
            self.samples[self.write_pos..].copy_from_slice(&samples[..space_at_end]);
            self.samples[..n - space_at_end].copy_from_slice(&samples[space_at_end..]);
        }
        self.write_pos = (self.write_pos + n) % self.capacity;
        self.total_written += n as u64;
    }

    /// Read the reference frame for a given playback offset.
    /// `elapsed` is in samples since `start_playback`, with the
    /// speaker-to-mic delay already subtracted.
    pub fn read_for_elapsed(&self, elapsed: i64, num_samples: usize) -> ReferenceRead {
        if self.playback_start.is_none() {
            return ReferenceRead::Inactive;
        }
        if elapsed < 0 {
            return ReferenceRead::Pending(vec![0; num_samples]);
        }

        let target = self.playback_start_sample + elapsed as u64;
        if target >= self.total_written {
            return ReferenceRead::Exhausted;
        }

        let offset = (target % self.capacity as u64) as usize;
        let mut frame = vec![0i16; num_samples];
        for (i, slot) in frame.iter_mut().enumerate() {
            if target + i as u64 >= self.total_written {
                break;
            }
            *slot = self.samples[(offset + i) % self.capacity];
        }
        ReferenceRead::Frame(frame)
    }

    /// Samples currently held in the ring.
    pub fn available(&self) -> usize {
        self.total_written.min(self.capacity as u64) as usize
    }

    pub fn clear(&mut self) {
        self.begin_registration();
        self.playback_start = None;
        self.playback_start_sample = 0;
    }
}

/// Non-owning capability handed to the playback side so it can feed the
/// canceller's reference signal and latch playback timing.
pub trait ReferenceSink: Send + Sync {
    /// Call before registering audio for a new playback.
    fn begin_registration(&self);
    /// Append rendered PCM. `is_first_chunk` restarts registration for
    /// streaming playback; `auto_start` latches timing on the first chunk
    /// when no playback is already timed.
    fn register(&self, samples: &[i16], sample_rate: u32, is_first_chunk: bool, auto_start: bool);
    /// Latch timing: the sink is being commanded now.
    fn start_playback(&self);
    fn end_playback(&self);
}

struct AecState {
    buffer: ReferenceBuffer,
    engine: Option<FrameCanceller>,
    frames_processed: u64,
    frames_cancelled: u64,
}

/// Application-level echo canceller: reference ring plus the NLMS frame
/// engine. Inactive or exhausted states pass the mic through untouched.
pub struct EchoCanceller {
    sample_rate: u32,
    delay_samples: i64,
    state: Mutex<AecState>,
}

impl EchoCanceller {
    pub fn new(config: AecConfig, sample_rate: u32) -> Self {
        let buffer_samples = (sample_rate as u64 * config.buffer_duration_ms / 1000) as usize;
        let filter_taps = (sample_rate as u64 * config.filter_length_ms / 1000) as usize;
        let delay_samples = (sample_rate as u64 * config.speaker_to_mic_delay_ms / 1000) as i64;

        let engine = if config.enabled {
            debug!(
                "AEC engine ready: frame_size={}, taps={} ({}ms), delay={}ms",
                config.frame_size, filter_taps, config.filter_length_ms,
                config.speaker_to_mic_delay_ms
            );
            Some(FrameCanceller::new(
                config.frame_size,
                filter_taps,
                config.enable_preprocess,
            ))
        } else {
            None
        };

        Self {
            sample_rate,
            delay_samples,
            state: Mutex::new(AecState {
                buffer: ReferenceBuffer::new(buffer_samples, sample_rate),
                engine,
                frames_processed: 0,
                frames_cancelled: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AecState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an engine is configured at all.
    pub fn is_enabled(&self) -> bool {
        self.lock().engine.is_some()
    }

    /// Whether cancellation is currently running (engine + timed playback).
    pub fn is_active(&self) -> bool {
        let state = self.lock();
        state.engine.is_some() && state.buffer.is_playing()
    }

    pub fn frames_cancelled(&self) -> u64 {
        self.lock().frames_cancelled
    }

    /// Remove the echo of current playback from a mic chunk. Without an
    /// engine or timed playback the input is returned unchanged,
    /// bit-for-bit.
    pub fn cancel_echo(&self, mic: &[i16]) -> Vec<i16> {
        let mut state = self.lock();
        let Some(raw_elapsed) = state.buffer.elapsed_samples() else {
            return mic.to_vec();
        };
        let elapsed = raw_elapsed - self.delay_samples;
        Self::cancel_frames(&mut state, mic, elapsed)
    }

    /// Deterministic variant: cancel with an explicit playback offset in
    /// samples (delay already applied). Frame `i` of the chunk reads the
    /// reference at `elapsed + i * frame_size`.
    pub fn cancel_echo_at(&self, mic: &[i16], elapsed: i64) -> Vec<i16> {
        let mut state = self.lock();
        Self::cancel_frames(&mut state, mic, elapsed)
    }

    fn cancel_frames(state: &mut AecState, mic: &[i16], base_elapsed: i64) -> Vec<i16> {
        let AecState {
            buffer,
            engine,
            frames_processed,
            frames_cancelled,
        } = state;

        let Some(engine) = engine.as_mut() else {
            return mic.to_vec();
        };
        if !buffer.is_playing() {
            return mic.to_vec();
        }

        let frame_size = engine.frame_size();
        let mut output = Vec::with_capacity(mic.len());

        for (i, chunk) in mic.chunks(frame_size).enumerate() {
            let frame_elapsed = base_elapsed + (i * frame_size) as i64;
            match buffer.read_for_elapsed(frame_elapsed, frame_size) {
                ReferenceRead::Inactive | ReferenceRead::Exhausted => {
                    output.extend_from_slice(chunk);
                }
                ReferenceRead::Pending(reference) | ReferenceRead::Frame(reference) => {
                    *frames_processed += 1;
                    // Short trailing frames are padded for the engine and
                    // truncated back afterwards
                    let original_len = chunk.len();
                    let mic_frame: Vec<i16> = if original_len < frame_size {
                        let mut padded = chunk.to_vec();
                        padded.resize(frame_size, 0);
                        padded
                    } else {
                        chunk.to_vec()
                    };

                    match engine.cancel(&mic_frame, &reference) {
                        Ok(processed) => {
                            output.extend_from_slice(&processed[..original_len]);
                            *frames_cancelled += 1;
                        }
                        Err(e) => {
                            warn!("AEC frame failed, passing through: {}", e);
                            output.extend_from_slice(chunk);
                        }
                    }
                }
            }
        }

        output
    }

    /// Drop all reference state and adaptation. The next playback start
    /// re-initializes cleanly.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.buffer.clear();
        if let Some(engine) = state.engine.as_mut() {
            engine.reset();
        }
        state.frames_processed = 0;
        state.frames_cancelled = 0;
    }
}

impl ReferenceSink for EchoCanceller {
    fn begin_registration(&self) {
        self.lock().buffer.begin_registration();
    }

    fn register(&self, samples: &[i16], sample_rate: u32, is_first_chunk: bool, auto_start: bool) {
        if samples.is_empty() {
            return;
        }

        let resampled;
        let samples = if sample_rate != self.sample_rate {
            resampled = Resampler::new(sample_rate, self.sample_rate).resample(samples);
            &resampled[..]
        } else {
            samples
        };

        let mut state = self.lock();
        if is_first_chunk {
            state.buffer.begin_registration();
        }
        state.buffer.write(samples);
        if auto_start && !state.buffer.is_playing() {
            state.buffer.start_playback();
        }
    }

    fn start_playback(&self) {
        self.lock().buffer.start_playback();
    }

    fn end_playback(&self) {
        self.lock().buffer.end_playback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(frame_size: usize, filter_length_ms: u64) -> AecConfig {
        AecConfig {
            enabled: true,
            frame_size,
            filter_length_ms,
            enable_preprocess: false,
            buffer_duration_ms: 15_000,
            speaker_to_mic_delay_ms: 50,
        }
    }

    fn tone(freq: f32, rate: f32, amplitude: f32, num_samples: usize) -> Vec<i16> {
        (0..num_samples)
            .map(|i| {
                (amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / rate).sin()) as i16
            })
            .collect()
    }

    fn energy(samples: &[i16]) -> f64 {
        samples.iter().map(|&s| (s as f64) * (s as f64)).sum()
    }

    #[test]
    fn test_passthrough_when_not_started() {
        // Registered but never started: output must be input, bit-for-bit.
        let aec = EchoCanceller::new(test_config(160, 400), 16_000);
        aec.begin_registration();
        aec.register(&tone(1000.0, 16000.0, 8000.0, 16000), 16_000, false, false);

        let mut state = 3u32;
        let mic: Vec<i16> = (0..16000)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 17) as i16
            })
            .collect();

        for chunk in mic.chunks(480) {
            assert_eq!(aec.cancel_echo(chunk), chunk);
        }
    }

    #[test]
    fn test_passthrough_when_disabled() {
        let config = AecConfig {
            enabled: false,
            ..test_config(160, 400)
        };
        let aec = EchoCanceller::new(config, 16_000);
        aec.register(&[100; 1600], 16_000, true, true);

        let mic = vec![123i16; 480];
        assert_eq!(aec.cancel_echo(&mic), mic);
        assert!(!aec.is_active());
    }

    #[test]
    fn test_passthrough_after_exhaustion() {
        // 0.1s registered; any offset beyond it passes the mic through.
        let aec = EchoCanceller::new(test_config(160, 20), 16_000);
        aec.begin_registration();
        aec.register(&tone(440.0, 16000.0, 8000.0, 1600), 16_000, false, false);
        aec.start_playback();

        let mic = vec![777i16; 160];
        let out = aec.cancel_echo_at(&mic, 1600);
        assert_eq!(out, mic);
        let out = aec.cancel_echo_at(&mic, 50_000);
        assert_eq!(out, mic);
    }

    #[test]
    fn test_active_cancellation_reduces_tone() {
        // Register a 2s 1 kHz tone and feed the mic the exact reference
        // segment for each offset: a unit echo path. The residual must drop
        // at least 20 dB once the filter has adapted.
        let aec = EchoCanceller::new(test_config(160, 20), 16_000);
        let reference = tone(1000.0, 16000.0, 8000.0, 32000);

        aec.begin_registration();
        aec.register(&reference, 16_000, false, false);
        aec.start_playback();

        let mut last_reduction = 0.0f64;
        for frame_idx in 0..50 {
            let elapsed = frame_idx * 160;
            let mic = &reference[elapsed..elapsed + 160];
            let out = aec.cancel_echo_at(mic, elapsed as i64);
            let in_e = energy(mic);
            let out_e = energy(&out);
            if in_e > 0.0 {
                last_reduction = 10.0 * (in_e / out_e.max(1e-12)).log10();
            }
        }
        assert!(
            last_reduction > 20.0,
            "expected >20 dB reduction after adaptation, got {:.1} dB",
            last_reduction
        );
    }

    #[test]
    fn test_pending_delay_window_keeps_mic() {
        // Before the acoustic path reaches the mic the engine sees a zero
        // reference, so the mic comes back unchanged (preprocess off).
        let aec = EchoCanceller::new(test_config(160, 20), 16_000);
        aec.begin_registration();
        aec.register(&tone(1000.0, 16000.0, 8000.0, 3200), 16_000, false, false);
        aec.start_playback();

        let mic = vec![512i16; 160];
        let out = aec.cancel_echo_at(&mic, -400);
        assert_eq!(out, mic);
    }

    #[test]
    fn test_end_playback_restores_passthrough() {
        let aec = EchoCanceller::new(test_config(160, 20), 16_000);
        aec.register(&tone(1000.0, 16000.0, 8000.0, 1600), 16_000, true, true);
        assert!(aec.is_active());

        aec.end_playback();
        assert!(!aec.is_active());

        let mic = vec![42i16; 480];
        assert_eq!(aec.cancel_echo(&mic), mic);
    }

    #[test]
    fn test_auto_start_latches_once() {
        let aec = EchoCanceller::new(test_config(160, 20), 16_000);
        aec.register(&[1i16; 160], 16_000, true, true);
        assert!(aec.is_active());
        // Subsequent chunks must not re-latch timing
        aec.register(&[2i16; 160], 16_000, false, true);
        assert!(aec.is_active());
    }

    #[test]
    fn test_ring_wrap_preserves_most_recent() {
        // After writing capacity + k samples, the last `capacity` samples
        // are readable in order.
        let capacity = 1000usize;
        let mut buffer = ReferenceBuffer::new(capacity, 16_000);
        buffer.begin_registration();

        let k = 137usize;
        let written: Vec<i16> = (0..(capacity + k) as i32).map(|i| i as i16).collect();
        buffer.write(&written);
        buffer.start_playback();

        assert_eq!(buffer.available(), capacity);

        // Oldest surviving logical position is k; read through the end
        let mut offset = k;
        while offset < capacity + k {
            let n = 100.min(capacity + k - offset);
            match buffer.read_for_elapsed(offset as i64, n) {
                ReferenceRead::Frame(frame) => {
                    assert_eq!(&frame[..], &written[offset..offset + n]);
                }
                _ => panic!("expected a frame at offset {}", offset),
            }
            offset += n;
        }

        // One past the end is exhausted
        assert!(matches!(
            buffer.read_for_elapsed((capacity + k) as i64, 10),
            ReferenceRead::Exhausted
        ));
    }

    #[test]
    fn test_begin_registration_preserves_timing() {
        let mut buffer = ReferenceBuffer::new(1000, 16_000);
        buffer.write(&[5i16; 100]);
        buffer.start_playback();
        assert!(buffer.is_playing());

        // A new registration while the previous sentence drains must not
        // drop the timing latch
        buffer.begin_registration();
        assert!(buffer.is_playing());
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_register_resamples_foreign_rate() {
        let aec = EchoCanceller::new(test_config(160, 20), 16_000);
        // 48 kHz content: 4800 samples become ~1600 at the AEC rate
        aec.register(&tone(1000.0, 48000.0, 8000.0, 4800), 48_000, true, false);
        let state = aec.lock();
        assert_eq!(state.buffer.available(), 1600);
    }
}
