//! Training configuration – `training.toml`.
//!
//! Split, augmentation and fit parameters for building a training set and
//! handing it to an external trainer.  Every field has a default, so an
//! empty file (or no file) is valid:
//!
//! ```toml
//! [split]
//! test_size = 0.2
//! seed = 42
//!
//! [augment]
//! enabled = true
//! gain_min = 0.8
//! gain_max = 1.2
//! max_shift = 0.1
//! noise_probability = 0.35
//! noise_std = 0.005
//!
//! [fit]
//! epochs = 60
//! batch_size = 16
//! validation_split = 0.2
//! learning_rate = 0.001
//! class_weighting = "balanced"
//!
//! [fit.early_stopping]
//! monitor = "val_accuracy"
//! patience = 8
//! restore_best_weights = true
//!
//! [fit.reduce_lr]
//! monitor = "val_loss"
//! factor = 0.5
//! patience = 4
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use respira_common::error::PipelineError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub split: SplitConfig,
    pub augment: AugmentConfig,
    pub fit: FitConfig,
}

/// Stratified train/test split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SplitConfig {
    /// Fraction of every class held out for testing.
    pub test_size: f64,
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            test_size: 0.2,
            seed: 42,
        }
    }
}

/// Training-split waveform augmentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AugmentConfig {
    pub enabled: bool,
    /// Uniform gain range.
    pub gain_min: f32,
    pub gain_max: f32,
    /// Circular shift bound as a fraction of the waveform length.
    pub max_shift: f32,
    /// Chance of adding Gaussian noise to an example.
    pub noise_probability: f32,
    pub noise_std: f32,
}

impl Default for AugmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            gain_min: 0.8,
            gain_max: 1.2,
            max_shift: 0.1,
            noise_probability: 0.35,
            noise_std: 0.005,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassWeighting {
    /// `n / (k * count_c)` per class.
    Balanced,
    None,
}

/// Fit parameters passed through to the external trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitConfig {
    pub epochs: u32,
    pub batch_size: u32,
    pub validation_split: f64,
    pub learning_rate: f64,
    pub class_weighting: ClassWeighting,
    pub early_stopping: EarlyStopping,
    pub reduce_lr: ReduceLrOnPlateau,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            epochs: 60,
            batch_size: 16,
            validation_split: 0.2,
            learning_rate: 1e-3,
            class_weighting: ClassWeighting::Balanced,
            early_stopping: EarlyStopping::default(),
            reduce_lr: ReduceLrOnPlateau::default(),
        }
    }
}

/// Stop when `monitor` has not improved for `patience` epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EarlyStopping {
    pub monitor: String,
    pub patience: u32,
    pub restore_best_weights: bool,
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self {
            monitor: "val_accuracy".to_string(),
            patience: 8,
            restore_best_weights: true,
        }
    }
}

/// Multiply the learning rate by `factor` after `patience` flat epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReduceLrOnPlateau {
    pub monitor: String,
    pub factor: f64,
    pub patience: u32,
}

impl Default for ReduceLrOnPlateau {
    fn default() -> Self {
        Self {
            monitor: "val_loss".to_string(),
            factor: 0.5,
            patience: 4,
        }
    }
}

impl TrainingConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: TrainingConfig = toml::from_str(text).context("Invalid training config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        let config =
            Self::from_toml(&text).with_context(|| format!("Invalid training config: {}", path.display()))?;
        info!(
            "Loaded training config from {} (test_size={}, augment={}, epochs={})",
            path.display(),
            config.split.test_size,
            config.augment.enabled,
            config.fit.epochs
        );
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        let s = &self.split;
        if !(s.test_size > 0.0 && s.test_size < 1.0) {
            return Err(PipelineError::config(format!(
                "split.test_size must be in (0, 1), got {}",
                s.test_size
            )));
        }
        let a = &self.augment;
        if !(a.gain_min > 0.0 && a.gain_min <= a.gain_max) {
            return Err(PipelineError::config(format!(
                "augment gain range {}..{} is invalid",
                a.gain_min, a.gain_max
            )));
        }
        if !(0.0..1.0).contains(&a.max_shift) {
            return Err(PipelineError::config("augment.max_shift must be in [0, 1)"));
        }
        if !(0.0..=1.0).contains(&a.noise_probability) || a.noise_std < 0.0 {
            return Err(PipelineError::config("augment noise parameters are invalid"));
        }
        let f = &self.fit;
        if f.epochs == 0 || f.batch_size == 0 {
            return Err(PipelineError::config("fit.epochs and fit.batch_size must be positive"));
        }
        if !(0.0..1.0).contains(&f.validation_split) {
            return Err(PipelineError::config("fit.validation_split must be in [0, 1)"));
        }
        if !(f.learning_rate > 0.0) {
            return Err(PipelineError::config("fit.learning_rate must be positive"));
        }
        if !(f.reduce_lr.factor > 0.0 && f.reduce_lr.factor < 1.0) {
            return Err(PipelineError::config("fit.reduce_lr.factor must be in (0, 1)"));
        }
        Ok(())
    }
}
