//! Turning raw class scores into the client-facing prediction.

use respira_common::error::{PipelineError, Result};
use respira_common::protocol::{round_to, PredictionResponse, ProbabilityMap, Visualizations};

use crate::mel::SpectralMatrix;

/// Maximum waveform points sent for rendering.
pub const MAX_WAVEFORM_POINTS: usize = 2000;
/// Mel crop sent for rendering.
pub const MEL_CROP: usize = 128;

/// Full-precision prediction before boundary rounding.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub label: String,
    /// Percent.
    pub confidence: f64,
    /// Label → percent, class order.
    pub probabilities: ProbabilityMap,
    pub visualizations: Visualizations,
}

impl PredictionResult {
    /// Boundary record: confidence to 2 decimals, probabilities to 4.
    pub fn into_response(self) -> PredictionResponse {
        PredictionResponse {
            predicted_disease: self.label,
            confidence: round_to(self.confidence, 2),
            probabilities: self
                .probabilities
                .iter()
                .map(|(l, p)| (l.to_string(), round_to(p, 4)))
                .collect(),
            visualizations: self.visualizations,
        }
    }
}

/// Label selection and percent map over a fixed class order.
pub struct ResultComposer {
    classes: Vec<String>,
}

impl ResultComposer {
    pub fn new(classes: Vec<String>) -> Self {
        Self { classes }
    }

    pub fn compose(
        &self,
        scores: &[f32],
        waveform: &[f32],
        sample_rate: u32,
        mel_db: &SpectralMatrix,
    ) -> Result<PredictionResult> {
        if scores.len() != self.classes.len() || scores.is_empty() {
            return Err(PipelineError::shape_mismatch(
                "class scores",
                self.classes.len(),
                scores.len(),
            ));
        }
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(PipelineError::inference("model produced non-finite scores"));
        }

        let sum: f64 = scores.iter().map(|&s| s as f64).sum();
        let probs: Vec<f64> = scores.iter().map(|&s| s as f64 / (sum + 1e-12)).collect();

        // First maximum wins on ties.
        let mut best = 0;
        for (i, &p) in probs.iter().enumerate() {
            if p > probs[best] {
                best = i;
            }
        }

        let probabilities = self
            .classes
            .iter()
            .zip(probs.iter())
            .map(|(label, &p)| (label.clone(), p * 100.0))
            .collect();

        Ok(PredictionResult {
            label: self.classes[best].clone(),
            confidence: probs[best] * 100.0,
            probabilities,
            visualizations: Visualizations {
                sample_rate,
                waveform: downsample(waveform, MAX_WAVEFORM_POINTS),
                mel_spectrogram: mel_db.crop(MEL_CROP, MEL_CROP),
            },
        })
    }
}

/// Evenly spaced point selection: indices `floor(linspace(0, n-1, k))`.
pub fn downsample(samples: &[f32], max_points: usize) -> Vec<f32> {
    let n = samples.len();
    let k = n.min(max_points);
    match k {
        0 => Vec::new(),
        1 => vec![samples[0]],
        _ => {
            let step = (n - 1) as f64 / (k - 1) as f64;
            (0..k)
                .map(|i| {
                    let idx = if i == k - 1 {
                        n - 1
                    } else {
                        (i as f64 * step).floor() as usize
                    };
                    samples[idx]
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use respira_common::config::CLASSES;

    fn composer() -> ResultComposer {
        ResultComposer::new(CLASSES.iter().map(|c| c.to_string()).collect())
    }

    fn mel(rows: usize, cols: usize) -> SpectralMatrix {
        SpectralMatrix::from_vec(rows, cols, (0..rows * cols).map(|i| i as f32).collect()).unwrap()
    }

    #[test]
    fn test_compose_percent_map() {
        let r = composer()
            .compose(&[0.1, 0.6, 0.05, 0.05, 0.2], &[0.0; 10], 16000, &mel(4, 4))
            .unwrap();
        assert_eq!(r.label, "Asthma");
        assert!((r.confidence - 60.0).abs() < 1e-4);
        assert_eq!(r.probabilities.len(), 5);
        assert!((r.probabilities.total() - 100.0).abs() < 1e-6);
        let labels: Vec<&str> = r.probabilities.labels().collect();
        assert_eq!(labels, CLASSES);
    }

    #[test]
    fn test_compose_renormalizes_drift() {
        let r = composer()
            .compose(&[0.2, 0.2, 0.2, 0.2, 0.4], &[], 16000, &mel(1, 1))
            .unwrap();
        assert_eq!(r.label, "COPD");
        assert!((r.probabilities.total() - 100.0).abs() < 1e-6);
        assert!((r.confidence - 100.0 / 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_compose_tie_picks_first() {
        let r = composer()
            .compose(&[0.2; 5], &[], 16000, &mel(1, 1))
            .unwrap();
        assert_eq!(r.label, "Normal");
    }

    #[test]
    fn test_compose_rejects_wrong_cardinality() {
        let err = composer()
            .compose(&[0.5, 0.5], &[], 16000, &mel(1, 1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_visualization_crop() {
        let r = composer()
            .compose(&[1.0, 0.0, 0.0, 0.0, 0.0], &[0.0; 10], 16000, &mel(130, 376))
            .unwrap();
        let m = &r.visualizations.mel_spectrogram;
        assert_eq!(m.len(), 128);
        assert!(m.iter().all(|row| row.len() == 128));
        assert_eq!(m[1][0], 376.0);

        let r = composer()
            .compose(&[1.0, 0.0, 0.0, 0.0, 0.0], &[0.0; 10], 16000, &mel(3, 5))
            .unwrap();
        assert_eq!(r.visualizations.mel_spectrogram.len(), 3);
        assert_eq!(r.visualizations.mel_spectrogram[0].len(), 5);
    }

    #[test]
    fn test_downsample_point_selection() {
        let x: Vec<f32> = (0..96000).map(|i| i as f32).collect();
        let d = downsample(&x, 2000);
        assert_eq!(d.len(), 2000);
        assert_eq!(d[0], 0.0);
        assert_eq!(d[1], 48.0); // floor(95999 / 1999)
        assert_eq!(d[1999], 95999.0);

        let short: Vec<f32> = (0..10).map(|i| i as f32).collect();
        assert_eq!(downsample(&short, 2000), short);
        assert!(downsample(&[], 2000).is_empty());
        assert_eq!(downsample(&[3.0], 2000), vec![3.0]);
    }

    #[test]
    fn test_into_response_rounds() {
        let r = composer()
            .compose(&[0.123456, 0.876544, 0.0, 0.0, 0.0], &[], 16000, &mel(1, 1))
            .unwrap()
            .into_response();
        assert_eq!(r.predicted_disease, "Asthma");
        assert_eq!(r.confidence, 87.65);
        assert_eq!(r.probabilities.get("Normal"), Some(12.3456));
        assert_eq!(r.probabilities.get("COPD"), Some(0.0));
    }
}
