//! Native baseline classifier.
//!
//! ```text
//! [H, W, 2]
//!   → conv3x3(32) relu → maxpool2
//!   → conv3x3(64) relu → maxpool2
//!   → conv3x3(128) relu → maxpool2
//!   → global average pool → dense(128) relu → dense(classes) softmax
//! ```
//!
//! Convolutions are `same`-padded, pools are 2×2 `valid`.  Dropout from the
//! training graph is inactive at inference and not represented.  Kernels are
//! stored `[kh, kw, cin, cout]`, dense weights `[in, out]`, both row-major.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tract_tflite::prelude::tract_ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2};

use respira_common::error::{PipelineError, Result};

use crate::features::FeatureTensor;

/// Tag written into every native model file.
pub const FORMAT_TAG: &str = "respira-cnn";
pub const FORMAT_VERSION: u32 = 1;

const CONV_FILTERS: [usize; 3] = [32, 64, 128];
const KERNEL: usize = 3;
const HIDDEN_UNITS: usize = 128;
/// Seed for freshly initialized (untrained) models.
pub const INIT_SEED: u64 = 42;

// ── types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2d {
    pub kernel: [usize; 2],
    pub in_channels: usize,
    pub out_channels: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub inputs: usize,
    pub outputs: usize,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

/// The serialized model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespiratoryCnn {
    pub format: String,
    pub version: u32,
    /// `[H, W, C]` the model was built for.
    pub input_shape: [usize; 3],
    pub num_classes: usize,
    pub conv: Vec<Conv2d>,
    pub hidden: Dense,
    pub output: Dense,
}

// ── construction ─────────────────────────────────────────────────────────

impl RespiratoryCnn {
    /// Untrained model with Glorot-uniform kernels and zero biases.
    pub fn untrained(input_shape: [usize; 3], num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        let mut conv = Vec::with_capacity(CONV_FILTERS.len());
        let mut cin = input_shape[2];
        for &cout in &CONV_FILTERS {
            conv.push(Conv2d::glorot(&mut rng, cin, cout));
            cin = cout;
        }
        let hidden = Dense::glorot(&mut rng, cin, HIDDEN_UNITS);
        let output = Dense::glorot(&mut rng, HIDDEN_UNITS, num_classes);

        Self {
            format: FORMAT_TAG.to_string(),
            version: FORMAT_VERSION,
            input_shape,
            num_classes,
            conv,
            hidden,
            output,
        }
    }

    /// Reject files whose tag, version or layer sizes are inconsistent.
    pub fn validate(&self) -> Result<()> {
        if self.format != FORMAT_TAG || self.version != FORMAT_VERSION {
            return Err(PipelineError::inference(format!(
                "unsupported model format {} v{}",
                self.format, self.version
            )));
        }
        if self.input_shape.iter().any(|&d| d == 0) {
            return Err(PipelineError::inference("model input shape has a zero dimension"));
        }

        let mut cin = self.input_shape[2];
        for (i, layer) in self.conv.iter().enumerate() {
            if layer.in_channels != cin {
                return Err(PipelineError::shape_mismatch(
                    format!("conv{i} input channels"),
                    cin,
                    layer.in_channels,
                ));
            }
            layer.check(i)?;
            cin = layer.out_channels;
        }
        if self.hidden.inputs != cin {
            return Err(PipelineError::shape_mismatch("hidden inputs", cin, self.hidden.inputs));
        }
        self.hidden.check("hidden")?;
        if self.output.inputs != self.hidden.outputs {
            return Err(PipelineError::shape_mismatch(
                "output inputs",
                self.hidden.outputs,
                self.output.inputs,
            ));
        }
        self.output.check("output")?;
        if self.output.outputs != self.num_classes {
            return Err(PipelineError::shape_mismatch(
                "output classes",
                self.num_classes,
                self.output.outputs,
            ));
        }
        Ok(())
    }

    /// Class probabilities for one feature tensor.
    pub fn predict(&self, input: &FeatureTensor) -> Result<Vec<f32>> {
        if input.shape() != self.input_shape {
            return Err(PipelineError::shape_mismatch(
                "model input",
                self.input_shape,
                input.shape(),
            ));
        }
        let [h, w, c] = self.input_shape;
        let mut x = Array3::from_shape_vec((h, w, c), input.as_slice().to_vec())
            .map_err(|e| PipelineError::inference(format!("cannot shape input: {e}")))?;

        for layer in &self.conv {
            x = max_pool2(&layer.forward(&x)?);
        }
        let pooled = global_average_pool(&x);
        let hidden = self.hidden.forward(&pooled)?.mapv(relu);
        let logits = self.output.forward(&hidden)?;
        Ok(softmax(&logits.to_vec()))
    }
}

fn glorot_uniform(rng: &mut StdRng, fan_in: usize, fan_out: usize, n: usize) -> Vec<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt() as f32;
    (0..n).map(|_| rng.gen_range(-limit..limit)).collect()
}

// ── layers ───────────────────────────────────────────────────────────────

impl Conv2d {
    fn glorot(rng: &mut StdRng, cin: usize, cout: usize) -> Self {
        let area = KERNEL * KERNEL;
        Self {
            kernel: [KERNEL, KERNEL],
            in_channels: cin,
            out_channels: cout,
            weights: glorot_uniform(rng, area * cin, area * cout, area * cin * cout),
            bias: vec![0.0; cout],
        }
    }

    fn check(&self, i: usize) -> Result<()> {
        let [kh, kw] = self.kernel;
        let expected = kh * kw * self.in_channels * self.out_channels;
        if self.weights.len() != expected || self.bias.len() != self.out_channels {
            return Err(PipelineError::shape_mismatch(
                format!("conv{i} parameters"),
                (expected, self.out_channels),
                (self.weights.len(), self.bias.len()),
            ));
        }
        Ok(())
    }

    /// `same`-padded convolution + ReLU, via im2col and one matrix product.
    fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (h, w, cin) = x.dim();
        let [kh, kw] = self.kernel;
        let (pad_y, pad_x) = (kh / 2, kw / 2);
        let k = kh * kw * cin;

        let mut cols = Array2::<f32>::zeros((h * w, k));
        for y in 0..h {
            for xx in 0..w {
                let mut row = cols.row_mut(y * w + xx);
                for dy in 0..kh {
                    let iy = y + dy;
                    if iy < pad_y || iy - pad_y >= h {
                        continue;
                    }
                    for dx in 0..kw {
                        let ix = xx + dx;
                        if ix < pad_x || ix - pad_x >= w {
                            continue;
                        }
                        let base = (dy * kw + dx) * cin;
                        for c in 0..cin {
                            row[base + c] = x[[iy - pad_y, ix - pad_x, c]];
                        }
                    }
                }
            }
        }

        let kernel = ArrayView2::from_shape((k, self.out_channels), &self.weights)
            .map_err(|e| PipelineError::inference(format!("conv kernel: {e}")))?;
        let mut out = cols.dot(&kernel);
        out += &ArrayView1::from(&self.bias[..]);
        out.mapv_inplace(relu);

        out.into_shape_with_order((h, w, self.out_channels))
            .map_err(|e| PipelineError::inference(format!("conv output: {e}")))
    }
}

impl Dense {
    fn glorot(rng: &mut StdRng, inputs: usize, outputs: usize) -> Self {
        Self {
            inputs,
            outputs,
            weights: glorot_uniform(rng, inputs, outputs, inputs * outputs),
            bias: vec![0.0; outputs],
        }
    }

    fn check(&self, name: &str) -> Result<()> {
        if self.weights.len() != self.inputs * self.outputs || self.bias.len() != self.outputs {
            return Err(PipelineError::shape_mismatch(
                format!("{name} parameters"),
                (self.inputs * self.outputs, self.outputs),
                (self.weights.len(), self.bias.len()),
            ));
        }
        Ok(())
    }

    fn forward(&self, x: &Array1<f32>) -> Result<Array1<f32>> {
        let weights = ArrayView2::from_shape((self.inputs, self.outputs), &self.weights)
            .map_err(|e| PipelineError::inference(format!("dense weights: {e}")))?;
        Ok(x.dot(&weights) + &ArrayView1::from(&self.bias[..]))
    }
}

fn relu(v: f32) -> f32 {
    v.max(0.0)
}

/// 2×2 max pool, stride 2, trailing odd row/column dropped.
fn max_pool2(x: &Array3<f32>) -> Array3<f32> {
    let (h, w, c) = x.dim();
    let (oh, ow) = (h / 2, w / 2);
    Array3::from_shape_fn((oh, ow, c), |(y, xx, ch)| {
        let (y0, x0) = (y * 2, xx * 2);
        x[[y0, x0, ch]]
            .max(x[[y0, x0 + 1, ch]])
            .max(x[[y0 + 1, x0, ch]])
            .max(x[[y0 + 1, x0 + 1, ch]])
    })
}

fn global_average_pool(x: &Array3<f32>) -> Array1<f32> {
    let (h, w, c) = x.dim();
    let n = (h * w).max(1) as f32;
    Array1::from_shape_fn(c, |ch| {
        let mut acc = 0.0f32;
        for y in 0..h {
            for xx in 0..w {
                acc += x[[y, xx, ch]];
            }
        }
        acc / n
    })
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

// ── tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::stack;
    use crate::mel::SpectralMatrix;

    fn tensor(h: usize, w: usize) -> FeatureTensor {
        let a = SpectralMatrix::from_vec(h, w, (0..h * w).map(|i| (i as f32 * 0.37).sin()).collect())
            .unwrap();
        let b = SpectralMatrix::from_vec(h, w, (0..h * w).map(|i| (i as f32 * 0.11).cos()).collect())
            .unwrap();
        stack(&[&a, &b]).unwrap()
    }

    #[test]
    fn test_untrained_is_valid_and_seeded() {
        let a = RespiratoryCnn::untrained([16, 20, 2], 5, INIT_SEED);
        let b = RespiratoryCnn::untrained([16, 20, 2], 5, INIT_SEED);
        assert_eq!(a, b);
        assert!(a.validate().is_ok());
        assert_eq!(a.conv.len(), 3);
        assert_eq!(a.conv[0].weights.len(), 3 * 3 * 2 * 32);
        assert_eq!(a.output.outputs, 5);
        assert!(a.conv.iter().all(|l| l.bias.iter().all(|&v| v == 0.0)));

        let limit = (6.0f32 / (18.0 + 288.0)).sqrt();
        assert!(a.conv[0].weights.iter().all(|w| w.abs() <= limit));
    }

    #[test]
    fn test_predict_is_probability_simplex() {
        let model = RespiratoryCnn::untrained([16, 24, 2], 5, INIT_SEED);
        let probs = model.predict(&tensor(16, 24)).unwrap();
        assert_eq!(probs.len(), 5);
        assert!(probs.iter().all(|&p| p.is_finite() && p >= 0.0));
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "sum {sum}");
    }

    #[test]
    fn test_predict_rejects_wrong_shape() {
        let model = RespiratoryCnn::untrained([16, 24, 2], 5, INIT_SEED);
        let err = model.predict(&tensor(16, 20)).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }), "got: {err}");
    }

    #[test]
    fn test_validate_catches_truncated_weights() {
        let mut model = RespiratoryCnn::untrained([8, 8, 2], 5, INIT_SEED);
        model.conv[1].weights.pop();
        assert!(matches!(
            model.validate().unwrap_err(),
            PipelineError::ShapeMismatch { .. }
        ));

        let mut model = RespiratoryCnn::untrained([8, 8, 2], 5, INIT_SEED);
        model.format = "other-cnn".to_string();
        assert!(matches!(model.validate().unwrap_err(), PipelineError::Inference(_)));
    }

    #[test]
    fn test_json_roundtrip_predicts_identically() {
        let model = RespiratoryCnn::untrained([8, 12, 2], 5, 7);
        let json = serde_json::to_string(&model).unwrap();
        let back: RespiratoryCnn = serde_json::from_str(&json).unwrap();
        let x = tensor(8, 12);
        assert_eq!(model.predict(&x).unwrap(), back.predict(&x).unwrap());
    }

    #[test]
    fn test_conv_same_padding_identity_kernel() {
        // Centre tap = 1 on channel 0 → output equals relu(input channel 0).
        let mut weights = vec![0.0f32; 3 * 3 * 1 * 1];
        weights[4] = 1.0;
        let conv = Conv2d {
            kernel: [3, 3],
            in_channels: 1,
            out_channels: 1,
            weights,
            bias: vec![0.0],
        };
        let x = Array3::from_shape_fn((3, 4, 1), |(y, xx, _)| y as f32 - xx as f32);
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.dim(), (3, 4, 1));
        for yy in 0..3 {
            for xx in 0..4 {
                assert_eq!(y[[yy, xx, 0]], (yy as f32 - xx as f32).max(0.0));
            }
        }
    }

    #[test]
    fn test_max_pool_and_gap() {
        let x = Array3::from_shape_fn((4, 5, 1), |(y, xx, _)| (y * 5 + xx) as f32);
        let p = max_pool2(&x);
        assert_eq!(p.dim(), (2, 2, 1));
        assert_eq!(p[[0, 0, 0]], 6.0);
        assert_eq!(p[[1, 1, 0]], 18.0);
        let g = global_average_pool(&p);
        assert_eq!(g[0], (6.0 + 8.0 + 16.0 + 18.0) / 4.0);
    }

    #[test]
    fn test_softmax() {
        let p = softmax(&[1.0, 1.0, 1.0, 1.0]);
        assert!(p.iter().all(|&v| (v - 0.25).abs() < 1e-6));
        let p = softmax(&[1000.0, 0.0]);
        assert!((p[0] - 1.0).abs() < 1e-6);
    }
}
