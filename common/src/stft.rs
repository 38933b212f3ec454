//! Short-time Fourier transform and its inverse.
//!
//! Conventions (shared by the denoiser and the feature extractor, so they
//! must not drift):
//!
//! | | |
//! |---|---|
//! | window | periodic Hann, length `n_fft` |
//! | framing | centred: `n_fft / 2` zeros padded on both sides |
//! | frames | `1 + len / hop` |
//! | bins | `n_fft / 2 + 1` (one-sided) |
//! | inverse | windowed overlap-add / Σ window², centre trimmed |

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// One-sided complex spectrogram stored frame-major:
/// `data[frame * n_bins + bin]`.
#[derive(Debug, Clone)]
pub struct Spectrum {
    pub n_bins: usize,
    pub n_frames: usize,
    pub data: Vec<Complex<f32>>,
}

impl Spectrum {
    pub fn frame(&self, t: usize) -> &[Complex<f32>] {
        &self.data[t * self.n_bins..(t + 1) * self.n_bins]
    }

    pub fn frame_mut(&mut self, t: usize) -> &mut [Complex<f32>] {
        &mut self.data[t * self.n_bins..(t + 1) * self.n_bins]
    }

    pub fn get(&self, bin: usize, t: usize) -> Complex<f32> {
        self.data[t * self.n_bins + bin]
    }

    /// `|X|^power` for every cell, same layout as `data`.
    pub fn magnitude_pow(&self, power: f32) -> Vec<f32> {
        if power == 2.0 {
            self.data.iter().map(|c| c.norm_sqr()).collect()
        } else {
            self.data.iter().map(|c| c.norm().powf(power)).collect()
        }
    }
}

/// Pre-planned STFT for a fixed `(n_fft, hop)` pair.
pub struct Stft {
    n_fft: usize,
    hop: usize,
    window: Vec<f32>,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
}

impl Stft {
    pub fn new(n_fft: usize, hop: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            n_fft,
            hop,
            window: hann_window(n_fft),
            forward: planner.plan_fft_forward(n_fft),
            inverse: planner.plan_fft_inverse(n_fft),
        }
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop(&self) -> usize {
        self.hop
    }

    pub fn n_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    pub fn frame_count(&self, n_samples: usize) -> usize {
        1 + n_samples / self.hop
    }

    /// Forward transform of `signal`.
    pub fn forward(&self, signal: &[f32]) -> Spectrum {
        let n_fft = self.n_fft;
        let pad = n_fft / 2;
        let n_bins = self.n_bins();
        let n_frames = self.frame_count(signal.len());

        // Zero-padded copy so every frame is a plain slice.
        let mut padded = vec![0.0f32; signal.len() + 2 * pad];
        padded[pad..pad + signal.len()].copy_from_slice(signal);

        let mut data = Vec::with_capacity(n_frames * n_bins);
        let mut buf = vec![Complex::new(0.0f32, 0.0); n_fft];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.forward.get_inplace_scratch_len()];

        for t in 0..n_frames {
            let start = t * self.hop;
            for (i, (b, &w)) in buf.iter_mut().zip(self.window.iter()).enumerate() {
                *b = Complex::new(padded[start + i] * w, 0.0);
            }
            self.forward.process_with_scratch(&mut buf, &mut scratch);
            data.extend_from_slice(&buf[..n_bins]);
        }

        Spectrum {
            n_bins,
            n_frames,
            data,
        }
    }

    /// Inverse transform, returning exactly `length` samples.
    ///
    /// Samples the overlap-add does not reach (or where the window envelope
    /// vanishes) are left at zero.
    pub fn inverse(&self, spec: &Spectrum, length: usize) -> Vec<f32> {
        let n_fft = self.n_fft;
        let pad = n_fft / 2;
        let n_frames = spec.n_frames;
        let full_len = n_fft + self.hop * n_frames.saturating_sub(1);

        let mut y = vec![0.0f32; full_len];
        let mut envelope = vec![0.0f32; full_len];
        let mut buf = vec![Complex::new(0.0f32, 0.0); n_fft];
        let mut scratch = vec![Complex::new(0.0f32, 0.0); self.inverse.get_inplace_scratch_len()];
        let scale = 1.0 / n_fft as f32;

        for t in 0..n_frames {
            hermitian_fill(spec.frame(t), &mut buf);
            self.inverse.process_with_scratch(&mut buf, &mut scratch);

            let start = t * self.hop;
            for (i, (c, &w)) in buf.iter().zip(self.window.iter()).enumerate() {
                y[start + i] += c.re * scale * w;
                envelope[start + i] += w * w;
            }
        }

        for (s, &e) in y.iter_mut().zip(envelope.iter()) {
            if e > f32::MIN_POSITIVE {
                *s /= e;
            }
        }

        let mut out = vec![0.0f32; length];
        let available = full_len.saturating_sub(pad).min(length);
        out[..available].copy_from_slice(&y[pad..pad + available]);
        out
    }
}

/// Rebuild the full `n_fft`-point spectrum from its one-sided half.
///
/// The imaginary parts of the DC and Nyquist bins are dropped, matching a
/// real inverse FFT.
fn hermitian_fill(half: &[Complex<f32>], full: &mut [Complex<f32>]) {
    let n = full.len();
    let n_bins = half.len();
    full[..n_bins].copy_from_slice(half);
    full[0].im = 0.0;
    if n % 2 == 0 {
        full[n / 2].im = 0.0;
    }
    for k in 1..n - n_bins + 1 {
        full[n - k] = half[k].conj();
    }
}

/// Periodic Hann window: `w[i] = 0.5 - 0.5 cos(2π i / n)`.
pub fn hann_window(n: usize) -> Vec<f32> {
    (0..n)
        .map(|i| {
            let x = std::f64::consts::PI * 2.0 * i as f64 / n as f64;
            (0.5 * (1.0 - x.cos())) as f32
        })
        .collect()
}

// ── tests ────────────────────────────────────────────────────────────────
