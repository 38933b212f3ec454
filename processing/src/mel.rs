//! Log-mel spectrogram and MFCC extraction.
//!
//! Both matrices come from one power spectrogram so they share the time
//! axis by construction:
//!
//! | step | mel | mfcc |
//! |---|---|---|
//! | STFT | n_fft 1024, hop 256, centred Hann | same |
//! | power | `\|X\|²` | same |
//! | filterbank | Slaney, 128 bands, fmin..fmax | same |
//! | dB reference | matrix max | 1.0 |
//! | top_db floor | 80 | 80 |
//! | DCT | – | orthonormal DCT-II, first 40 |

use respira_common::config::FeatureConfig;
use respira_common::stft::Stft;

/// Power floor before taking the logarithm.
const AMIN: f64 = 1e-10;
/// Dynamic range kept below the matrix maximum.
const TOP_DB: f32 = 80.0;

// ── types ────────────────────────────────────────────────────────────────

/// Row-major `[frequency][frame]` float matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl SpectralMatrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Wrap a row-major buffer.  Returns `None` when the length disagrees.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Option<Self> {
        (data.len() == rows * cols).then_some(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn map_in_place(&mut self, f: impl Fn(f32) -> f32) {
        for v in self.data.iter_mut() {
            *v = f(*v);
        }
    }

    /// Keep the first `cols` frames of every row.
    pub fn truncate_cols(&self, cols: usize) -> Self {
        let cols = cols.min(self.cols);
        let mut out = Self::zeros(self.rows, cols);
        for r in 0..self.rows {
            out.row_mut(r).copy_from_slice(&self.row(r)[..cols]);
        }
        out
    }

    /// Truncate or zero-pad the row count to `rows`.
    pub fn fix_rows(&self, rows: usize) -> Self {
        let mut data = self.data.clone();
        data.resize(rows * self.cols, 0.0);
        Self {
            rows,
            cols: self.cols,
            data,
        }
    }

    /// Top-left `min(rows, R) × min(cols, C)` block as nested rows.
    pub fn crop(&self, rows: usize, cols: usize) -> Vec<Vec<f32>> {
        let cols = cols.min(self.cols);
        (0..rows.min(self.rows))
            .map(|r| self.row(r)[..cols].to_vec())
            .collect()
    }

    pub fn max(&self) -> f32 {
        self.data.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

/// Mel and MFCC matrices of one waveform.
#[derive(Debug, Clone)]
pub struct SpectralFeatures {
    /// `[n_mels][frames]`, dB relative to the matrix max.
    pub mel_db: SpectralMatrix,
    /// `[n_mfcc][frames]`.
    pub mfcc: SpectralMatrix,
}

/// Pre-computed state for a [`FeatureConfig`] at one sample rate.
pub struct FeatureExtractor {
    stft: Stft,
    n_mels: usize,
    n_mfcc: usize,
    /// `[n_mels][n_bins]` row-major.
    mel_basis: Vec<f32>,
    /// `[n_mfcc][n_mels]` row-major.
    dct_basis: Vec<f32>,
}

// ── construction ─────────────────────────────────────────────────────────

impl FeatureExtractor {
    pub fn new(cfg: &FeatureConfig, sample_rate: u32) -> Self {
        let stft = Stft::new(cfg.n_fft, cfg.hop_length);
        let mel_basis = slaney_mel_filterbank(
            sample_rate as f64,
            cfg.n_fft,
            cfg.n_mels,
            cfg.fmin as f64,
            cfg.fmax as f64,
        );
        let dct_basis = dct_ortho_basis(cfg.n_mfcc, cfg.n_mels);
        Self {
            stft,
            n_mels: cfg.n_mels,
            n_mfcc: cfg.n_mfcc,
            mel_basis,
            dct_basis,
        }
    }

    pub fn n_mels(&self) -> usize {
        self.n_mels
    }

    /// Frame count produced for `n_samples` input samples.
    pub fn frame_count(&self, n_samples: usize) -> usize {
        self.stft.frame_count(n_samples)
    }

    /// Compute the log-mel and MFCC matrices for `samples`.
    pub fn extract(&self, samples: &[f32]) -> SpectralFeatures {
        let mel_power = self.mel_power(samples);

        let mut mel_db = mel_power.clone();
        let reference = mel_power.max() as f64;
        power_to_db(&mut mel_db, reference);

        let mut log_mel = mel_power;
        power_to_db(&mut log_mel, 1.0);
        let mfcc = self.dct(&log_mel);

        SpectralFeatures { mel_db, mfcc }
    }

    /// Mel-filtered power spectrogram `[n_mels][frames]`.
    fn mel_power(&self, samples: &[f32]) -> SpectralMatrix {
        let spec = self.stft.forward(samples);
        let power = spec.magnitude_pow(2.0);
        let n_bins = spec.n_bins;
        let n_frames = spec.n_frames;

        let mut mel = SpectralMatrix::zeros(self.n_mels, n_frames);
        for m in 0..self.n_mels {
            let weights = &self.mel_basis[m * n_bins..(m + 1) * n_bins];
            let row = mel.row_mut(m);
            for (t, out) in row.iter_mut().enumerate() {
                let frame = &power[t * n_bins..(t + 1) * n_bins];
                *out = weights.iter().zip(frame).map(|(w, p)| w * p).sum();
            }
        }
        mel
    }

    /// Project `[n_mels][frames]` onto the first `n_mfcc` DCT-II rows.
    fn dct(&self, log_mel: &SpectralMatrix) -> SpectralMatrix {
        let n_frames = log_mel.cols();
        let mut out = SpectralMatrix::zeros(self.n_mfcc, n_frames);
        for k in 0..self.n_mfcc {
            let basis = &self.dct_basis[k * self.n_mels..(k + 1) * self.n_mels];
            for t in 0..n_frames {
                let mut acc = 0.0f64;
                for (m, &b) in basis.iter().enumerate() {
                    acc += b as f64 * log_mel.get(m, t) as f64;
                }
                out.data[k * n_frames + t] = acc as f32;
            }
        }
        out
    }
}

// ── helpers ──────────────────────────────────────────────────────────────

/// `10·log10(max(AMIN, S)) - 10·log10(max(AMIN, reference))`, floored at
/// `max - TOP_DB`.
pub fn power_to_db(m: &mut SpectralMatrix, reference: f64) {
    let ref_db = 10.0 * reference.max(AMIN).log10();
    m.map_in_place(|v| (10.0 * (v as f64).max(AMIN).log10() - ref_db) as f32);
    let floor = m.max() - TOP_DB;
    m.map_in_place(|v| v.max(floor));
}

const F_SP: f64 = 200.0 / 3.0;
const MIN_LOG_HZ: f64 = 1000.0;
const MIN_LOG_MEL: f64 = MIN_LOG_HZ / F_SP;

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

/// Slaney mel scale: linear below 1 kHz, logarithmic above.
pub fn hz_to_mel(hz: f64) -> f64 {
    if hz >= MIN_LOG_HZ {
        MIN_LOG_MEL + (hz / MIN_LOG_HZ).ln() / log_step()
    } else {
        hz / F_SP
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    if mel >= MIN_LOG_MEL {
        MIN_LOG_HZ * (log_step() * (mel - MIN_LOG_MEL)).exp()
    } else {
        mel * F_SP
    }
}

/// Triangular Slaney-normalized filterbank, `[n_mels][n_fft/2 + 1]`.
fn slaney_mel_filterbank(sr: f64, n_fft: usize, n_mels: usize, fmin: f64, fmax: f64) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|i| i as f64 * (sr / 2.0) / (n_bins - 1).max(1) as f64)
        .collect();

    // n_mels + 2 edges evenly spaced on the mel axis.
    let mel_min = hz_to_mel(fmin);
    let mel_max = hz_to_mel(fmax);
    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut weights = vec![0.0f32; n_mels * n_bins];
    for m in 0..n_mels {
        let (lo, center, hi) = (edges[m], edges[m + 1], edges[m + 2]);
        let enorm = 2.0 / (hi - lo);
        for (b, &f) in fft_freqs.iter().enumerate() {
            let lower = (f - lo) / (center - lo);
            let upper = (hi - f) / (hi - center);
            let w = lower.min(upper).max(0.0);
            weights[m * n_bins + b] = (w * enorm) as f32;
        }
    }
    weights
}

/// First `n_out` rows of the orthonormal DCT-II matrix of size `n`.
fn dct_ortho_basis(n_out: usize, n: usize) -> Vec<f32> {
    let mut basis = vec![0.0f32; n_out * n];
    for k in 0..n_out {
        let scale = if k == 0 {
            (1.0 / n as f64).sqrt()
        } else {
            (2.0 / n as f64).sqrt()
        };
        for i in 0..n {
            let angle = std::f64::consts::PI * k as f64 * (2 * i + 1) as f64 / (2 * n) as f64;
            basis[k * n + i] = (scale * angle.cos()) as f32;
        }
    }
    basis
}

// ── tests ────────────────────────────────────────────────────────────────
