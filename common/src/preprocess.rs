//! Waveform conditioning shared by live prediction and training-set building.
//!
//! ```text
//! decode → resample → denoise ─┬─────────────┬→ normalize → pad/trim
//!                              └─ [augment] ─┘
//! ```
//!
//! [`Preprocessor::condition`] covers the first half, [`Preprocessor::finalize`]
//! the second; the dataset builder slots augmentation in between.  Inference
//! calls [`Preprocessor::run`], which is exactly `condition` then `finalize`.

use std::ops::Range;

use rustfft::num_complex::Complex;
use tracing::debug;

use crate::audio::{self, AudioFormat, Waveform};
use crate::config::AudioConfig;
use crate::error::Result;
use crate::stft::{Stft, Spectrum};

/// Spectral-gate window and hop.  Frozen independently of the feature STFT.
pub const GATE_N_FFT: usize = 1024;
pub const GATE_HOP: usize = 256;
/// Noise floor percentile (per frequency bin, across time).
pub const GATE_PERCENTILE: f32 = 10.0;
/// A bin is kept when its magnitude reaches this multiple of the floor.
pub const GATE_FACTOR: f32 = 1.5;

/// Peak amplitude below which a signal is treated as silence.
const SILENCE_EPS: f64 = 1e-8;

/// Stationary-noise suppression by per-bin spectral gating.
pub struct SpectralGate {
    stft: Stft,
    percentile: f32,
    factor: f32,
}

impl Default for SpectralGate {
    fn default() -> Self {
        Self::new(GATE_N_FFT, GATE_HOP, GATE_PERCENTILE, GATE_FACTOR)
    }
}

impl SpectralGate {
    pub fn new(n_fft: usize, hop: usize, percentile: f32, factor: f32) -> Self {
        Self {
            stft: Stft::new(n_fft, hop),
            percentile,
            factor,
        }
    }

    /// Gate `samples`; the output has the same length.
    ///
    /// Signals shorter than one window are returned unchanged.
    pub fn apply(&self, samples: &[f32]) -> Vec<f32> {
        if samples.len() < self.stft.n_fft() {
            return samples.to_vec();
        }

        let mut spec = self.stft.forward(samples);
        let thresholds: Vec<f32> = self
            .noise_floor(&spec)
            .into_iter()
            .map(|f| f * self.factor)
            .collect();

        let mut kept = 0usize;
        for t in 0..spec.n_frames {
            for (c, &thr) in spec.frame_mut(t).iter_mut().zip(thresholds.iter()) {
                // Kept bins retain magnitude and phase, i.e. the original value.
                if c.norm() >= thr {
                    kept += 1;
                } else {
                    *c = Complex::new(0.0, 0.0);
                }
            }
        }
        debug!(
            "Spectral gate: {} frames, kept {:.1}% of bins",
            spec.n_frames,
            100.0 * kept as f64 / spec.data.len().max(1) as f64
        );

        self.stft.inverse(&spec, samples.len())
    }

    /// Per-bin magnitude percentile across all frames.
    fn noise_floor(&self, spec: &Spectrum) -> Vec<f32> {
        let mut column = Vec::with_capacity(spec.n_frames);
        (0..spec.n_bins)
            .map(|bin| {
                column.clear();
                column.extend((0..spec.n_frames).map(|t| spec.get(bin, t).norm()));
                percentile(&mut column, self.percentile)
            })
            .collect()
    }
}

/// `q`-th percentile (0–100) with linear interpolation between order
/// statistics.  Sorts `values` in place.  Empty input yields 0.
pub fn percentile(values: &mut [f32], q: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let pos = (q.clamp(0.0, 100.0) as f64 / 100.0) * (values.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    (values[lo] as f64 + (values[hi] as f64 - values[lo] as f64) * frac) as f32
}

/// Remove the DC offset and scale the peak to 1.
///
/// Near-silent input is returned mean-subtracted only.
pub fn normalize(samples: &[f32]) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64;
    let centered: Vec<f32> = samples.iter().map(|&s| (s as f64 - mean) as f32).collect();
    let peak = centered.iter().fold(0.0f32, |m, &s| m.max(s.abs())) as f64;
    if peak < SILENCE_EPS {
        return centered;
    }
    centered
        .into_iter()
        .map(|s| (s as f64 / peak) as f32)
        .collect()
}

/// Keep the first `target_len` samples, or right-pad with zeros.
pub fn pad_or_trim(mut samples: Vec<f32>, target_len: usize) -> Vec<f32> {
    samples.resize(target_len, 0.0);
    samples
}

const TRIM_FRAME: usize = 2048;
const TRIM_HOP: usize = 512;

/// Sample range spanning every frame within `top_db` of the loudest frame.
///
/// Frames are centred RMS windows.  Empty or all-silent input yields an
/// empty range.
pub fn trim_silence(samples: &[f32], top_db: f32) -> Range<usize> {
    if samples.is_empty() {
        return 0..0;
    }
    let pad = TRIM_FRAME / 2;
    let n_frames = 1 + samples.len() / TRIM_HOP;
    let rms: Vec<f64> = (0..n_frames)
        .map(|t| {
            // Frame t covers padded[t*hop .. t*hop + frame]; shift back by pad.
            let start = (t * TRIM_HOP) as isize - pad as isize;
            let energy: f64 = (0..TRIM_FRAME as isize)
                .filter_map(|i| {
                    let idx = start + i;
                    (idx >= 0 && (idx as usize) < samples.len()).then(|| samples[idx as usize])
                })
                .map(|s| (s as f64) * (s as f64))
                .sum();
            (energy / TRIM_FRAME as f64).sqrt()
        })
        .collect();

    const AMIN: f64 = 1e-5;
    let reference = rms.iter().cloned().fold(0.0f64, f64::max).max(AMIN);
    let ref_db = 20.0 * reference.log10();
    let loud: Vec<usize> = rms
        .iter()
        .enumerate()
        .filter(|&(_, &r)| 20.0 * r.max(AMIN).log10() - ref_db > -(top_db as f64))
        .map(|(t, _)| t)
        .collect();

    match (loud.first(), loud.last()) {
        (Some(&first), Some(&last)) if reference > AMIN => {
            let start = first * TRIM_HOP;
            let end = ((last + 1) * TRIM_HOP).min(samples.len());
            start.min(end)..end
        }
        _ => 0..0,
    }
}

/// The canonical waveform path: decoded audio in, fixed-length
/// normalized waveform at the target rate out.
pub struct Preprocessor {
    audio: AudioConfig,
    gate: SpectralGate,
}

impl Preprocessor {
    pub fn new(audio: AudioConfig) -> Self {
        Self {
            audio,
            gate: SpectralGate::default(),
        }
    }

    pub fn target_len(&self) -> usize {
        self.audio.target_len(self.audio.target_sr)
    }

    /// Resample to the target rate and gate stationary noise.
    pub fn condition(&self, wave: Waveform) -> Result<Waveform> {
        let wave = audio::resample(wave, self.audio.target_sr)?;
        let samples = self.gate.apply(&wave.samples);
        Ok(Waveform::new(samples, wave.sample_rate))
    }

    /// Normalize and fix the length.
    pub fn finalize(&self, wave: Waveform) -> Waveform {
        let samples = pad_or_trim(normalize(&wave.samples), self.target_len());
        Waveform::new(samples, wave.sample_rate)
    }

    /// `condition` followed by `finalize`.
    pub fn run(&self, wave: Waveform) -> Result<Waveform> {
        Ok(self.finalize(self.condition(wave)?))
    }

    /// Decode `bytes` and run the full waveform path.
    pub fn run_bytes(&self, bytes: &[u8], declared: Option<AudioFormat>) -> Result<Waveform> {
        self.run(audio::decode(bytes, declared)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(n: usize, freq: f32, sr: u32, amp: f32) -> Vec<f32> {
        (0..n)
            .map(|i| amp * (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    /// Deterministic uniform noise in [-amp, amp].
    fn noise(n: usize, amp: f32, mut state: u64) -> Vec<f32> {
        (0..n)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let u = (state >> 40) as f32 / (1u64 << 24) as f32;
                amp * (2.0 * u - 1.0)
            })
            .collect()
    }

    fn rms(x: &[f32]) -> f32 {
        (x.iter().map(|s| s * s).sum::<f32>() / x.len() as f32).sqrt()
    }

    #[test]
    fn test_percentile_linear_interpolation() {
        let mut v = vec![4.0, 1.0, 3.0, 2.0, 5.0];
        assert!((percentile(&mut v, 10.0) - 1.4).abs() < 1e-6);
        assert!((percentile(&mut v, 50.0) - 3.0).abs() < 1e-6);
        assert!((percentile(&mut v, 100.0) - 5.0).abs() < 1e-6);
        assert_eq!(percentile(&mut [], 10.0), 0.0);
        assert_eq!(percentile(&mut [7.0], 10.0), 7.0);
    }

    #[test]
    fn test_gate_short_signal_unchanged() {
        let x = tone(1023, 440.0, 16000, 0.7);
        let y = SpectralGate::default().apply(&x);
        assert_eq!(x, y);
    }

    #[test]
    fn test_gate_preserves_length() {
        let x = tone(5000, 440.0, 16000, 0.5);
        let y = SpectralGate::default().apply(&x);
        assert_eq!(y.len(), 5000);
        assert!(y.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_gate_zero_signal_stays_zero() {
        let y = SpectralGate::default().apply(&vec![0.0; 4096]);
        assert!(y.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_gate_attenuates_stationary_noise() {
        // Noise throughout, a tone burst in the middle third.
        let n = 16000 * 3;
        let mut x = noise(n, 0.05, 7);
        let burst = tone(16000, 600.0, 16000, 0.8);
        for (s, b) in x[16000..32000].iter_mut().zip(burst.iter()) {
            *s += b;
        }
        let y = SpectralGate::default().apply(&x);

        let noise_before = rms(&x[2000..14000]);
        let noise_after = rms(&y[2000..14000]);
        assert!(
            noise_after < noise_before,
            "noise rms {noise_before} → {noise_after}"
        );

        let tone_before = rms(&x[18000..30000]);
        let tone_after = rms(&y[18000..30000]);
        assert!(
            (tone_after / tone_before) > 0.8,
            "tone rms {tone_before} → {tone_after}"
        );
    }

    #[test]
    fn test_gate_deterministic() {
        let x = noise(8000, 0.3, 11);
        let gate = SpectralGate::default();
        assert_eq!(gate.apply(&x), gate.apply(&x));
    }

    #[test]
    fn test_normalize_zero_mean_unit_peak() {
        let x: Vec<f32> = tone(4000, 300.0, 16000, 0.3).iter().map(|s| s + 0.2).collect();
        let y = normalize(&x);
        let mean = y.iter().map(|&s| s as f64).sum::<f64>() / y.len() as f64;
        let peak = y.iter().fold(0.0f32, |m, &s| m.max(s.abs()));
        assert!(mean.abs() < 1e-5, "mean {mean}");
        assert!((peak - 1.0).abs() < 1e-6, "peak {peak}");
    }

    #[test]
    fn test_normalize_silence_is_not_scaled() {
        let y = normalize(&vec![0.0; 100]);
        assert!(y.iter().all(|&s| s == 0.0));

        // Constant input: mean removed, no division.
        let y = normalize(&vec![0.25; 100]);
        assert!(y.iter().all(|&s| s.abs() < 1e-7));

        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn test_pad_or_trim() {
        let x: Vec<f32> = (0..10).map(|i| i as f32).collect();
        assert_eq!(pad_or_trim(x.clone(), 10), x);
        assert_eq!(pad_or_trim(x.clone(), 4), vec![0.0, 1.0, 2.0, 3.0]);
        let padded = pad_or_trim(x.clone(), 13);
        assert_eq!(&padded[..10], &x[..]);
        assert_eq!(&padded[10..], &[0.0, 0.0, 0.0]);
        assert_eq!(pad_or_trim(Vec::new(), 3), vec![0.0; 3]);
    }

    #[test]
    fn test_trim_silence_finds_burst() {
        let mut x = vec![0.0f32; 16000];
        let burst = tone(4000, 440.0, 16000, 0.5);
        x[6000..10000].copy_from_slice(&burst);
        let r = trim_silence(&x, 30.0);
        assert!(r.start <= 6000 && r.start >= 6000 - 2048, "range {r:?}");
        assert!(r.end >= 10000 && r.end <= 10000 + 2048, "range {r:?}");
    }

    #[test]
    fn test_trim_silence_empty_and_silent() {
        assert_eq!(trim_silence(&[], 30.0), 0..0);
        assert_eq!(trim_silence(&vec![0.0; 5000], 30.0), 0..0);
    }

    #[test]
    fn test_three_seconds_of_silence_pads_to_six() {
        let pre = Preprocessor::new(AudioConfig::default());
        let out = pre.run(Waveform::new(vec![0.0; 48000], 16000)).unwrap();
        assert_eq!(out.sample_rate, 16000);
        assert_eq!(out.len(), 96000);
        assert!(out.samples[..48000].iter().all(|&s| s == 0.0));
        assert!(out.samples[48000..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_resample_and_length_identity_at_target() {
        let pre = Preprocessor::new(AudioConfig::default());
        let x = tone(96000, 250.0, 16000, 0.9);
        let wave = Waveform::new(x.clone(), 16000);

        let resampled = audio::resample(wave, 16000).unwrap();
        assert_eq!(resampled.samples, x);
        let adjusted = pad_or_trim(resampled.samples, pre.target_len());
        assert_eq!(adjusted, x);
    }

    #[test]
    fn test_run_output_length_for_any_input() {
        let pre = Preprocessor::new(AudioConfig::default());
        for (n, sr) in [(100, 16000), (20000, 8000), (300000, 44100)] {
            let out = pre.run(Waveform::new(tone(n, 200.0, sr, 0.5), sr)).unwrap();
            assert_eq!(out.len(), 96000, "input {n} @ {sr}");
            assert!(out.samples.iter().all(|s| s.abs() <= 1.0 + 1e-6));
        }
    }

    #[test]
    fn test_run_bytes_rejects_empty() {
        let pre = Preprocessor::new(AudioConfig::default());
        let err = pre.run_bytes(&[], None).unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::Decode(_)));
    }

    #[test]
    fn test_run_bytes_rejects_huge_declared_rate() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 2_147_483_647,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..64 {
                writer.write_sample(1000i16).unwrap();
            }
            writer.finalize().unwrap();
        }

        let pre = Preprocessor::new(AudioConfig::default());
        let err = pre.run_bytes(&cursor.into_inner(), None).unwrap_err();
        assert!(matches!(err, crate::error::PipelineError::Decode(_)));
        assert!(err.client_message().starts_with("Invalid audio"), "{}", err.client_message());
    }
}
