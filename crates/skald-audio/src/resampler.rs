//! Rational polyphase resampling for the capture and reference paths.
//!
//! Converts between the device capture rate and the pipeline target rate
//! (typically 48 kHz → 16 kHz) with a windowed-sinc anti-aliasing lowpass.
//! The polyphase bank is precomputed at construction, so per-chunk work is
//! allocation-bounded: one output vector, no history kept between calls.

use std::f32::consts::PI;

/// Windowed-sinc lowpass FIR, Blackman window, normalized to unity DC gain.
fn design_lowpass(num_taps: usize, cutoff: f32) -> Vec<f32> {
    if num_taps == 0 {
        return Vec::new();
    }

    let m = num_taps - 1;
    let mut coeffs = Vec::with_capacity(num_taps);

    for n in 0..num_taps {
        let x = n as f32 - m as f32 / 2.0;

        let sinc = if x.abs() < 1e-7 {
            cutoff
        } else {
            (PI * cutoff * x).sin() / (PI * x)
        };

        let window = if m == 0 {
            1.0
        } else {
            let phase = 2.0 * PI * n as f32 / m as f32;
            0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos()
        };

        coeffs.push(sinc * window);
    }

    let sum: f32 = coeffs.iter().sum();
    if sum.abs() > 1e-10 {
        for c in coeffs.iter_mut() {
            *c /= sum;
        }
    }

    coeffs
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

/// Fixed-ratio sample rate converter for int16 mono audio.
pub struct Resampler {
    src_rate: u32,
    dst_rate: u32,
    /// Upsample factor P (after GCD reduction)
    p: usize,
    /// Downsample factor Q (after GCD reduction)
    q: usize,
    /// P polyphase sub-filters decomposed from the prototype lowpass
    polyphase: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        let g = gcd(dst_rate as usize, src_rate as usize);
        let p = dst_rate as usize / g;
        let q = src_rate as usize / g;

        let polyphase = if p == 1 && q == 1 {
            Vec::new()
        } else {
            let num_taps = 4 * p.max(q) * 10 + 1;
            let cutoff = 0.9 / p.max(q) as f32;
            let prototype = design_lowpass(num_taps, cutoff);

            let taps_per_phase = num_taps.div_ceil(p);
            let mut bank = vec![vec![0.0f32; taps_per_phase]; p];
            for (tap_idx, &coeff) in prototype.iter().enumerate() {
                bank[tap_idx % p][tap_idx / p] = coeff;
            }
            bank
        };

        Self {
            src_rate,
            dst_rate,
            p,
            q,
            polyphase,
        }
    }

    pub fn src_rate(&self) -> u32 {
        self.src_rate
    }

    pub fn dst_rate(&self) -> u32 {
        self.dst_rate
    }

    /// Resample one chunk. Identity rates return the input unchanged;
    /// output samples are clamped to the int16 range.
    pub fn resample(&self, input: &[i16]) -> Vec<i16> {
        if self.p == 1 && self.q == 1 {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let out_len = (input.len() * self.p).div_ceil(self.q);
        let mut output = Vec::with_capacity(out_len);

        for m in 0..out_len {
            // Position in the P-upsampled sequence determines both the
            // contributing input sample and the polyphase branch.
            let full_idx = m * self.q;
            let n = full_idx / self.p;
            let k = full_idx % self.p;

            let mut acc = 0.0f32;
            for (i, &coeff) in self.polyphase[k].iter().enumerate() {
                if n >= i && n - i < input.len() {
                    acc += coeff * input[n - i] as f32;
                }
            }

            let sample = (acc * self.p as f32).round().clamp(i16::MIN as f32, i16::MAX as f32);
            output.push(sample as i16);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_wave(frequency: f32, sample_rate: f32, amplitude: f32, num_samples: usize) -> Vec<i16> {
        (0..num_samples)
            .map(|i| {
                (amplitude * (2.0 * PI * frequency * i as f32 / sample_rate).sin()) as i16
            })
            .collect()
    }

    fn rms(samples: &[i16]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    #[test]
    fn test_identity_rate_returns_input() {
        let resampler = Resampler::new(16000, 16000);
        let input = vec![1000i16, -2000, 3000, i16::MAX, i16::MIN];
        assert_eq!(resampler.resample(&input), input);
    }

    #[test]
    fn test_48k_to_16k_length() {
        let resampler = Resampler::new(48000, 16000);
        let input = vec![0i16; 1440];
        let output = resampler.resample(&input);
        assert_eq!(output.len(), 480);
    }

    #[test]
    fn test_empty_input() {
        let resampler = Resampler::new(48000, 16000);
        assert!(resampler.resample(&[]).is_empty());
    }

    #[test]
    fn test_tone_survives_downsampling() {
        // 1 kHz is well below the 8 kHz output Nyquist; energy should be
        // roughly preserved through the 3:1 conversion.
        let resampler = Resampler::new(48000, 16000);
        let input = sine_wave(1000.0, 48000.0, 10000.0, 48000);
        let output = resampler.resample(&input);

        let in_rms = rms(&input);
        let out_rms = rms(&output[480..]);
        let ratio = out_rms / in_rms;
        assert!(
            (0.8..1.2).contains(&ratio),
            "tone energy should survive: in_rms={:.0}, out_rms={:.0}",
            in_rms,
            out_rms
        );
    }

    #[test]
    fn test_aliasing_band_rejected() {
        // 10 kHz is above the 8 kHz output Nyquist and must be attenuated
        // by the anti-aliasing lowpass rather than folded down.
        let resampler = Resampler::new(48000, 16000);
        let input = sine_wave(10000.0, 48000.0, 10000.0, 48000);
        let output = resampler.resample(&input);

        let in_rms = rms(&input);
        let out_rms = rms(&output[480..]);
        assert!(
            out_rms < in_rms * 0.1,
            "10 kHz should be rejected: in_rms={:.0}, out_rms={:.0}",
            in_rms,
            out_rms
        );
    }

    #[test]
    fn test_extreme_values_clamped() {
        let resampler = Resampler::new(48000, 16000);
        let input: Vec<i16> = (0..1440)
            .map(|i| if i % 2 == 0 { i16::MAX } else { i16::MIN })
            .collect();
        // Must not panic; all outputs are valid i16 by construction
        let output = resampler.resample(&input);
        assert_eq!(output.len(), 480);
    }

    #[test]
    fn test_upsampling_length() {
        let resampler = Resampler::new(16000, 48000);
        let input = vec![100i16; 160];
        let output = resampler.resample(&input);
        assert_eq!(output.len(), 480);
    }
}
