//! Configuration parsing – reads a KEY=VALUE file (`respira.conf`).
//!
//! The audio, feature and model settings are process-wide constants: they are
//! loaded once at startup and never mutated.  Training-set building and live
//! prediction must run with the same values or the persisted model no longer
//! matches the tensors it is fed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::info;

use crate::error::{PipelineError, Result};

/// Fixed class taxonomy.  The order defines the index → label mapping of the
/// classifier output and must never change without retraining.
pub const CLASSES: [&str; 5] = ["Normal", "Asthma", "Pneumonia", "Bronchitis", "COPD"];

/// Waveform conditioning parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    /// Sample rate every waveform is resampled to (Hz).
    pub target_sr: u32,
    /// Fixed duration every waveform is padded / truncated to (seconds).
    pub duration_seconds: f64,
    /// dB floor for the optional silence-trimming utility.
    pub top_db: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            target_sr: 16000,
            duration_seconds: 6.0,
            top_db: 30.0,
        }
    }
}

impl AudioConfig {
    /// Number of samples every conditioned waveform has at `sample_rate`.
    pub fn target_len(&self, sample_rate: u32) -> usize {
        (self.duration_seconds * sample_rate as f64) as usize
    }
}

/// Spectral feature parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    pub n_mels: usize,
    pub n_mfcc: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub fmin: f32,
    pub fmax: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            n_mels: 128,
            n_mfcc: 40,
            n_fft: 1024,
            hop_length: 256,
            fmin: 20.0,
            fmax: 8000.0,
        }
    }
}

impl FeatureConfig {
    /// Time-frame count of a centred STFT over `n_samples` samples.
    pub fn frame_count(&self, n_samples: usize) -> usize {
        1 + n_samples / self.hop_length
    }
}

/// Classifier contract: label order and input channel count.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub classes: Vec<String>,
    /// `[mel, mfcc]` stacked.
    pub input_channels: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            classes: CLASSES.iter().map(|c| c.to_string()).collect(),
            input_channels: 2,
        }
    }
}

impl ModelConfig {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn class_index(&self, label: &str) -> Option<usize> {
        self.classes.iter().position(|c| c == label)
    }
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub audio: AudioConfig,
    pub features: FeatureConfig,
    pub model: ModelConfig,

    // ── paths ────────────────────────────────────────────────────────
    /// Persisted classifier.  Created on first use when absent.
    pub model_path: PathBuf,
    /// Root of the training dataset (`audio/` + `metadata.csv`).
    pub dataset_dir: PathBuf,
    /// Optional TOML file with training-set and fit parameters.
    pub training_config: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            features: FeatureConfig::default(),
            model: ModelConfig::default(),
            model_path: PathBuf::from("model").join("model.json"),
            dataset_dir: PathBuf::from("dataset").join("icbhi_2017"),
            training_config: None,
        }
    }
}

impl Config {
    /// Directory holding the per-class audio files.
    pub fn audio_dir(&self) -> PathBuf {
        self.dataset_dir.join("audio")
    }

    /// CSV mapping relative filename → label.
    pub fn metadata_csv(&self) -> PathBuf {
        self.dataset_dir.join("metadata.csv")
    }

    /// Reject combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let a = &self.audio;
        let f = &self.features;
        if a.target_sr == 0 {
            return Err(PipelineError::config("TARGET_SR must be positive"));
        }
        if !(a.duration_seconds > 0.0) {
            return Err(PipelineError::config("DURATION_SECONDS must be positive"));
        }
        if f.n_fft == 0 || f.hop_length == 0 {
            return Err(PipelineError::config("N_FFT and HOP_LENGTH must be positive"));
        }
        if f.n_mels == 0 || f.n_mfcc == 0 {
            return Err(PipelineError::config("N_MELS and N_MFCC must be positive"));
        }
        if f.n_mfcc > f.n_mels {
            return Err(PipelineError::config(format!(
                "N_MFCC ({}) cannot exceed N_MELS ({})",
                f.n_mfcc, f.n_mels
            )));
        }
        if f.fmin < 0.0 || f.fmin >= f.fmax {
            return Err(PipelineError::config(format!(
                "invalid mel band: FMIN={} FMAX={}",
                f.fmin, f.fmax
            )));
        }
        let nyquist = a.target_sr as f32 / 2.0;
        if f.fmax > nyquist {
            return Err(PipelineError::config(format!(
                "FMAX ({}) exceeds the Nyquist frequency ({nyquist})",
                f.fmax
            )));
        }
        if self.model.input_channels != 2 {
            return Err(PipelineError::config("the feature tensor always has 2 channels"));
        }
        Ok(())
    }
}

/// Parse a `KEY=VALUE` configuration file.
///
/// Lines starting with `#` are comments.  Values may be optionally
/// double-quoted.  Unknown keys are silently ignored, missing keys take their
/// defaults, malformed values are an error.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        PipelineError::config(format!("cannot read config {}: {e}", path.display()))
    })?;

    let config = from_map(&parse_conf(&text))?;
    info!("Loaded config from {}", path.display());
    Ok(config)
}

fn from_map(map: &HashMap<String, String>) -> Result<Config> {
    let defaults = Config::default();

    let audio = AudioConfig {
        target_sr: get_parsed(map, "TARGET_SR", defaults.audio.target_sr)?,
        duration_seconds: get_parsed(map, "DURATION_SECONDS", defaults.audio.duration_seconds)?,
        top_db: get_parsed(map, "TOP_DB", defaults.audio.top_db)?,
    };
    let features = FeatureConfig {
        n_mels: get_parsed(map, "N_MELS", defaults.features.n_mels)?,
        n_mfcc: get_parsed(map, "N_MFCC", defaults.features.n_mfcc)?,
        n_fft: get_parsed(map, "N_FFT", defaults.features.n_fft)?,
        hop_length: get_parsed(map, "HOP_LENGTH", defaults.features.hop_length)?,
        fmin: get_parsed(map, "FMIN", defaults.features.fmin)?,
        fmax: get_parsed(map, "FMAX", defaults.features.fmax)?,
    };

    let config = Config {
        audio,
        features,
        model: ModelConfig::default(),
        model_path: map
            .get("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_path),
        dataset_dir: map
            .get("DATASET_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.dataset_dir),
        training_config: map
            .get("TRAINING_CONFIG")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from),
    };
    config.validate()?;
    Ok(config)
}

fn get_parsed<T: FromStr>(map: &HashMap<String, String>, key: &str, default: T) -> Result<T> {
    match map.get(key) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| PipelineError::config(format!("malformed value for {key}: {v:?}"))),
    }
}

/// Parse `KEY=VALUE` lines into a map, stripping optional double-quotes.
fn parse_conf(text: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, val)) = line.split_once('=') {
            let key = key.trim();
            let val = val.trim().trim_matches('"');
            map.insert(key.to_string(), val.to_string());
        }
    }
    map
}

// ─── tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conf() {
        let text = r#"
# comment
TARGET_SR=16000
MODEL_PATH="/var/lib/respira/model.json"
FMAX = 8000
"#;
        let map = parse_conf(text);
        assert_eq!(map["TARGET_SR"], "16000");
        assert_eq!(map["MODEL_PATH"], "/var/lib/respira/model.json");
        assert_eq!(map["FMAX"], "8000");
    }

    #[test]
    fn test_defaults_match_frozen_constants() {
        let c = Config::default();
        assert_eq!(c.audio.target_sr, 16000);
        assert_eq!(c.audio.duration_seconds, 6.0);
        assert_eq!(c.audio.top_db, 30.0);
        assert_eq!(c.features.n_mels, 128);
        assert_eq!(c.features.n_mfcc, 40);
        assert_eq!(c.features.n_fft, 1024);
        assert_eq!(c.features.hop_length, 256);
        assert_eq!(c.model.classes, CLASSES);
        assert_eq!(c.model.input_channels, 2);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_target_len_and_frames() {
        let c = Config::default();
        assert_eq!(c.audio.target_len(16000), 96000);
        assert_eq!(c.features.frame_count(96000), 376);
    }

    #[test]
    fn test_load_file() {
        let tmp = tempfile("load.conf", "DURATION_SECONDS=4\nDATASET_DIR=/tmp/ds\n");
        let config = load(&tmp).unwrap();
        assert_eq!(config.audio.duration_seconds, 4.0);
        assert_eq!(config.audio.target_sr, 16000);
        assert_eq!(config.audio_dir(), PathBuf::from("/tmp/ds/audio"));
        assert_eq!(config.metadata_csv(), PathBuf::from("/tmp/ds/metadata.csv"));
    }

    #[test]
    fn test_malformed_value_is_config_error() {
        let mut map = HashMap::new();
        map.insert("N_MELS".to_string(), "lots".to_string());
        let err = from_map(&map).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)), "got: {err}");
    }

    #[test]
    fn test_fmax_above_nyquist_rejected() {
        let mut map = HashMap::new();
        map.insert("TARGET_SR".to_string(), "8000".to_string());
        let err = from_map(&map).unwrap_err();
        assert!(err.to_string().contains("Nyquist"), "got: {err}");
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = load(Path::new("/tmp/does_not_exist_respira.conf")).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_class_index() {
        let m = ModelConfig::default();
        assert_eq!(m.num_classes(), 5);
        assert_eq!(m.class_index("Normal"), Some(0));
        assert_eq!(m.class_index("COPD"), Some(4));
        assert_eq!(m.class_index("Flu"), None);
    }

    fn tempfile(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("respira_config_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }
}
