//! Fixed-frame adaptive echo cancellation engine.
//!
//! A normalized LMS filter models the speaker-to-mic echo path: the
//! reference signal (what the device is rendering) is the filter input, the
//! mic frame is the desired signal, and the error output is the mic with the
//! predicted echo removed.
//!
//! ```text
//! μ_eff  = μ / (x^T x + δ)
//! y[n]   = Σ w[k] * x[n-k]     (predicted echo)
//! e[n]   = d[n] - y[n]          (mic minus echo — the output)
//! w[k]  += μ_eff * e[n] * x[n-k]
//! ```
//!
//! Stability holds for 0 < μ < 2 independent of signal level; δ guards the
//! normalization when the reference is silent.

use crate::error::{AudioError, Result};

const DEFAULT_STEP_SIZE: f32 = 0.5;
const DEFAULT_REGULARIZATION: f32 = 1e-6;

/// One-pole DC blocker, run over the mic path when preprocess is enabled.
/// y[n] = x[n] - x[n-1] + R * y[n-1]
struct DcBlocker {
    prev_input: f32,
    prev_output: f32,
}

impl DcBlocker {
    const R: f32 = 0.995;

    fn new() -> Self {
        Self {
            prev_input: 0.0,
            prev_output: 0.0,
        }
    }

    fn process(&mut self, x: f32) -> f32 {
        let y = x - self.prev_input + Self::R * self.prev_output;
        self.prev_input = x;
        self.prev_output = y;
        y
    }

    fn reset(&mut self) {
        self.prev_input = 0.0;
        self.prev_output = 0.0;
    }
}

/// NLMS echo canceller operating on fixed-size int16 frames.
pub struct FrameCanceller {
    frame_size: usize,
    weights: Vec<f32>,
    /// Circular reference history, one slot per filter tap
    history: Vec<f32>,
    pos: usize,
    /// Running Σx² over the history, updated incrementally
    power: f32,
    step_size: f32,
    regularization: f32,
    preprocess: Option<DcBlocker>,
}

impl FrameCanceller {
    /// `taps` is the echo tail length in samples (filter_length_ms at the
    /// AEC sample rate).
    pub fn new(frame_size: usize, taps: usize, enable_preprocess: bool) -> Self {
        Self {
            frame_size,
            weights: vec![0.0; taps],
            history: vec![0.0; taps],
            pos: 0,
            power: 0.0,
            step_size: DEFAULT_STEP_SIZE,
            regularization: DEFAULT_REGULARIZATION,
            preprocess: enable_preprocess.then(DcBlocker::new),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Cancel the echo of `reference` from `mic`. Both slices must be
    /// exactly one frame long.
    pub fn cancel(&mut self, mic: &[i16], reference: &[i16]) -> Result<Vec<i16>> {
        if mic.len() != self.frame_size || reference.len() != self.frame_size {
            return Err(AudioError::Engine(format!(
                "frame size mismatch: mic={}, ref={}, expected {}",
                mic.len(),
                reference.len(),
                self.frame_size
            )));
        }

        let taps = self.weights.len();
        let mut output = Vec::with_capacity(self.frame_size);

        for (&m, &r) in mic.iter().zip(reference.iter()) {
            let x = r as f32 / 32768.0;
            let mut d = m as f32 / 32768.0;
            if let Some(dc) = self.preprocess.as_mut() {
                d = dc.process(d);
            }

            // Slide the reference history and keep Σx² current
            let evicted = self.history[self.pos];
            self.power += x * x - evicted * evicted;
            self.history[self.pos] = x;

            // Predicted echo: y[n] = Σ w[k] * x[n-k]
            let mut y = 0.0f32;
            for k in 0..taps {
                let idx = (self.pos + taps - k) % taps;
                y += self.weights[k] * self.history[idx];
            }

            let e = d - y;

            // Normalized weight update
            let mu_e = self.step_size * e / (self.power.max(0.0) + self.regularization);
            for k in 0..taps {
                let idx = (self.pos + taps - k) % taps;
                self.weights[k] += mu_e * self.history[idx];
            }

            self.pos = (self.pos + 1) % taps;

            let sample = (e * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32);
            output.push(sample as i16);
        }

        Ok(output)
    }

    /// Zero the weights, history and preprocess state. Step size is kept.
    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.history.fill(0.0);
        self.pos = 0;
        self.power = 0.0;
        if let Some(dc) = self.preprocess.as_mut() {
            dc.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Park–Miller style PRNG for deterministic test signals.
    fn next_rand(state: &mut u32) -> i16 {
        *state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        ((*state >> 16) as i16) / 4
    }

    fn energy(samples: &[i16]) -> f64 {
        samples.iter().map(|&s| (s as f64) * (s as f64)).sum()
    }

    #[test]
    fn test_frame_size_mismatch_rejected() {
        let mut engine = FrameCanceller::new(160, 160, false);
        let short = vec![0i16; 100];
        let full = vec![0i16; 160];
        assert!(engine.cancel(&short, &full).is_err());
        assert!(engine.cancel(&full, &short).is_err());
    }

    #[test]
    fn test_zero_reference_passes_mic_through() {
        // With a silent reference the filter predicts nothing, so the mic
        // comes back (numerically) unchanged.
        let mut engine = FrameCanceller::new(160, 320, false);
        let mut state = 7u32;
        let mic: Vec<i16> = (0..160).map(|_| next_rand(&mut state)).collect();
        let zeros = vec![0i16; 160];
        let out = engine.cancel(&mic, &zeros).unwrap();
        assert_eq!(out, mic);
    }

    #[test]
    fn test_converges_on_identity_echo_path() {
        // mic == reference models a unit echo path with zero delay. After
        // adaptation the residual should be at least 20 dB below the input.
        let frame = 160;
        let mut engine = FrameCanceller::new(frame, frame, false);
        let mut state = 42u32;

        let mut last_in = 0.0f64;
        let mut last_out = 0.0f64;
        for _ in 0..50 {
            let signal: Vec<i16> = (0..frame).map(|_| next_rand(&mut state)).collect();
            let out = engine.cancel(&signal, &signal).unwrap();
            last_in = energy(&signal);
            last_out = energy(&out);
        }

        let reduction_db = 10.0 * (last_in / last_out.max(1e-12)).log10();
        assert!(
            reduction_db > 20.0,
            "expected >20 dB echo reduction, got {:.1} dB",
            reduction_db
        );
    }

    #[test]
    fn test_reset_clears_adaptation() {
        let frame = 160;
        let mut engine = FrameCanceller::new(frame, frame, false);
        let mut state = 9u32;
        for _ in 0..20 {
            let signal: Vec<i16> = (0..frame).map(|_| next_rand(&mut state)).collect();
            engine.cancel(&signal, &signal).unwrap();
        }

        engine.reset();

        // A fresh filter with silent reference passes the mic unchanged
        let mic: Vec<i16> = (0..frame).map(|_| next_rand(&mut state)).collect();
        let zeros = vec![0i16; frame];
        let out = engine.cancel(&mic, &zeros).unwrap();
        assert_eq!(out, mic);
    }

    #[test]
    fn test_silent_everything_is_finite() {
        let mut engine = FrameCanceller::new(160, 640, true);
        let zeros = vec![0i16; 160];
        for _ in 0..10 {
            let out = engine.cancel(&zeros, &zeros).unwrap();
            assert!(out.iter().all(|&s| s == 0));
        }
    }
}
