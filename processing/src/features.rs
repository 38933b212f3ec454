//! Alignment and standardization of the spectral matrices into the
//! classifier input.
//!
//! The MFCC matrix is truncated / zero-padded to the mel bin count so the two
//! can be stacked as channels.  That reshape is lossy but any trained model
//! depends on it, so it stays.

use respira_common::error::{PipelineError, Result};

use crate::mel::{SpectralFeatures, SpectralMatrix};

/// Standard deviation below which a matrix is only mean-centred.
const STD_EPS: f64 = 1e-6;

/// `[height][width][channel]` float tensor, channel 0 = mel, 1 = MFCC.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor {
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<f32>,
}

impl FeatureTensor {
    /// `[H, W, C]`.
    pub fn shape(&self) -> [usize; 3] {
        [self.height, self.width, self.channels]
    }

    pub fn get(&self, h: usize, w: usize, c: usize) -> f32 {
        self.data[(h * self.width + w) * self.channels + c]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Extract channel `c` as a matrix.
    pub fn channel(&self, c: usize) -> SpectralMatrix {
        let data = (0..self.height * self.width)
            .map(|i| self.data[i * self.channels + c])
            .collect();
        SpectralMatrix::from_vec(self.height, self.width, data)
            .unwrap_or_else(|| SpectralMatrix::zeros(self.height, self.width))
    }
}

/// Stack equal-shaped matrices along a trailing channel axis.
pub fn stack(channels: &[&SpectralMatrix]) -> Result<FeatureTensor> {
    let first = channels
        .first()
        .ok_or_else(|| PipelineError::shape_mismatch("feature channels", "≥1", 0))?;
    let (height, width) = first.shape();
    if let Some(bad) = channels.iter().find(|m| m.shape() != (height, width)) {
        return Err(PipelineError::shape_mismatch(
            "feature channel",
            (height, width),
            bad.shape(),
        ));
    }

    let n_ch = channels.len();
    let mut data = vec![0.0f32; height * width * n_ch];
    for (c, m) in channels.iter().enumerate() {
        for (i, &v) in m.as_slice().iter().enumerate() {
            data[i * n_ch + c] = v;
        }
    }
    Ok(FeatureTensor {
        height,
        width,
        channels: n_ch,
        data,
    })
}

/// Global z-score.  Near-constant matrices are only mean-centred.
pub fn standardize(m: &SpectralMatrix) -> SpectralMatrix {
    let n = m.as_slice().len();
    if n == 0 {
        return m.clone();
    }
    let mean = m.as_slice().iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = m
        .as_slice()
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / n as f64;
    let std = var.sqrt();

    let mut out = m.clone();
    if std < STD_EPS {
        out.map_in_place(|v| (v as f64 - mean) as f32);
    } else {
        out.map_in_place(|v| ((v as f64 - mean) / std) as f32);
    }
    out
}

/// Bring both matrices to `[mel rows][common frames]`.
pub fn align(mel: &SpectralMatrix, mfcc: &SpectralMatrix) -> (SpectralMatrix, SpectralMatrix) {
    let frames = mel.cols().min(mfcc.cols());
    let mel = mel.truncate_cols(frames);
    let mfcc = mfcc.truncate_cols(frames).fix_rows(mel.rows());
    (mel, mfcc)
}

/// Align, standardize and stack the two feature channels.
pub fn build_tensor(features: &SpectralFeatures) -> Result<FeatureTensor> {
    let (mel, mfcc) = align(&features.mel_db, &features.mfcc);
    stack(&[&standardize(&mel), &standardize(&mfcc)])
}
