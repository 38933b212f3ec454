//! Training-set building.
//!
//! Expected dataset layout:
//!
//! ```text
//! <dataset_dir>/
//!   audio/          recordings referenced by metadata.csv
//!   metadata.csv    filename,label
//! ```
//!
//! Each example runs through the same [`FeaturePipeline`] as live
//! prediction, with augmentation slotted between conditioning and
//! finalizing on the training split only.  The result is exported as raw
//! little-endian f32 tensors plus a JSON sidecar for an external trainer.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use respira_common::audio::{self, Waveform};
use respira_common::config::{Config, ModelConfig};
use respira_common::error::PipelineError;

use crate::analysis::FeaturePipeline;
use crate::features::FeatureTensor;
use crate::training::{AugmentConfig, ClassWeighting, FitConfig, TrainingConfig};

// ── metadata ─────────────────────────────────────────────────────────────

/// One labelled recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRow {
    /// Relative to the audio directory.
    pub filename: String,
    pub label: String,
    pub class_index: usize,
}

/// Read `filename,label` rows, dropping labels the model does not know.
pub fn load_metadata(csv: &Path, model: &ModelConfig) -> Result<Vec<MetadataRow>> {
    let text = fs::read_to_string(csv).map_err(|e| {
        PipelineError::config(format!(
            "Missing metadata CSV at {} ({e}). Create it with columns: filename,label",
            csv.display()
        ))
    })?;

    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = parse_csv_line(lines.next().unwrap_or_default());
    let column = |name: &str| header.iter().position(|h| h.trim() == name);
    let (Some(file_col), Some(label_col)) = (column("filename"), column("label")) else {
        return Err(PipelineError::config("metadata.csv must contain columns: filename,label").into());
    };

    let mut rows = Vec::new();
    let mut dropped = 0usize;
    for line in lines {
        let fields = parse_csv_line(line);
        let (Some(filename), Some(label)) = (fields.get(file_col), fields.get(label_col)) else {
            dropped += 1;
            continue;
        };
        let label = label.trim();
        match model.class_index(label) {
            Some(class_index) if !filename.trim().is_empty() => rows.push(MetadataRow {
                filename: filename.trim().to_string(),
                label: label.to_string(),
                class_index,
            }),
            _ => dropped += 1,
        }
    }

    if rows.is_empty() {
        return Err(PipelineError::config("No rows with valid labels found in metadata.csv.").into());
    }
    info!(
        "Loaded {} metadata rows from {} ({} dropped)",
        rows.len(),
        csv.display(),
        dropped
    );
    Ok(rows)
}

/// Split one CSV record.  Double-quoted fields may contain commas and `""`.
fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}

// ── split ────────────────────────────────────────────────────────────────

/// Per-class seeded shuffle, `round(count × test_size)` rows of each class
/// to the test split.  Classes with two or more rows keep at least one row
/// on each side.
pub fn stratified_split(
    rows: &[MetadataRow],
    test_size: f64,
    seed: u64,
) -> (Vec<MetadataRow>, Vec<MetadataRow>) {
    let mut by_class: BTreeMap<usize, Vec<MetadataRow>> = BTreeMap::new();
    for row in rows {
        by_class.entry(row.class_index).or_default().push(row.clone());
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for (_, mut group) in by_class {
        group.shuffle(&mut rng);
        let count = group.len();
        let n_test = if count >= 2 {
            ((count as f64 * test_size).round() as usize).clamp(1, count - 1)
        } else {
            0
        };
        test.extend(group.drain(..n_test));
        train.extend(group);
    }
    (train, test)
}

// ── augmentation ─────────────────────────────────────────────────────────

/// Random gain, circular shift and optional Gaussian noise.
pub struct Augmenter {
    cfg: AugmentConfig,
    rng: StdRng,
}

impl Augmenter {
    pub fn new(cfg: AugmentConfig, seed: u64) -> Self {
        Self {
            cfg,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn apply(&mut self, samples: &mut [f32]) {
        if samples.is_empty() {
            return;
        }
        let gain = if self.cfg.gain_min < self.cfg.gain_max {
            self.rng.gen_range(self.cfg.gain_min..self.cfg.gain_max)
        } else {
            self.cfg.gain_min
        };
        for s in samples.iter_mut() {
            *s *= gain;
        }

        let n = samples.len();
        let frac = if self.cfg.max_shift > 0.0 {
            self.rng.gen_range(-self.cfg.max_shift..self.cfg.max_shift)
        } else {
            0.0
        };
        let shift = (frac as f64 * n as f64) as i64;
        samples.rotate_right(shift.rem_euclid(n as i64) as usize);

        if self.rng.gen::<f32>() < self.cfg.noise_probability {
            for s in samples.iter_mut() {
                *s += self.cfg.noise_std * self.standard_normal();
            }
        }
    }

    /// Box–Muller.
    fn standard_normal(&mut self) -> f32 {
        let u1: f64 = 1.0 - self.rng.gen::<f64>();
        let u2: f64 = self.rng.gen();
        ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
    }
}

// ── class weights ────────────────────────────────────────────────────────

/// Balanced weights `n / (k × count_c)` over the `k` classes present.
pub fn class_weights(labels: &[usize]) -> BTreeMap<usize, f64> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for &l in labels {
        *counts.entry(l).or_default() += 1;
    }
    let n = labels.len() as f64;
    let k = counts.len() as f64;
    counts
        .into_iter()
        .map(|(class, count)| (class, n / (k * count as f64)))
        .collect()
}

// ── building ─────────────────────────────────────────────────────────────

/// Tensors of one split, in row order.
#[derive(Debug, Default)]
pub struct FeatureSet {
    pub tensors: Vec<FeatureTensor>,
    pub labels: Vec<usize>,
    pub files: Vec<String>,
    /// Rows whose audio file was absent.
    pub skipped: Vec<String>,
}

impl FeatureSet {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// `[N, H, W, C]`.
    pub fn shape(&self) -> [usize; 4] {
        let [h, w, c] = self.tensors.first().map(|t| t.shape()).unwrap_or([0, 0, 0]);
        [self.tensors.len(), h, w, c]
    }
}

/// Train and test splits ready for export.
#[derive(Debug)]
pub struct Datasets {
    pub train: FeatureSet,
    pub test: FeatureSet,
    /// Empty when class weighting is disabled.
    pub class_weights: BTreeMap<usize, f64>,
}

pub struct DatasetBuilder<'a> {
    config: &'a Config,
    training: &'a TrainingConfig,
    pipeline: FeaturePipeline,
}

impl<'a> DatasetBuilder<'a> {
    pub fn new(config: &'a Config, training: &'a TrainingConfig) -> Self {
        Self {
            config,
            training,
            pipeline: FeaturePipeline::new(config),
        }
    }

    /// Feature tensor for one recording.
    pub fn build_example(
        &self,
        path: &Path,
        augmenter: Option<&mut Augmenter>,
    ) -> Result<FeatureTensor> {
        let pre = self.pipeline.preprocessor();
        let wave = audio::load_file(path)?;
        let mut wave = pre.condition(wave)?;
        if let Some(aug) = augmenter {
            aug.apply(&mut wave.samples);
        }
        let wave: Waveform = pre.finalize(wave);
        let (tensor, _) = self.pipeline.extract(&wave)?;
        Ok(tensor)
    }

    /// Build every row whose audio exists.  Fails when none does.
    pub fn build_set(
        &self,
        rows: &[MetadataRow],
        mut augmenter: Option<&mut Augmenter>,
    ) -> Result<FeatureSet> {
        let audio_dir = self.config.audio_dir();
        let mut set = FeatureSet::default();

        for row in rows {
            let path = audio_dir.join(&row.filename);
            if !path.exists() {
                warn!("Skipping {}: file not found", path.display());
                set.skipped.push(row.filename.clone());
                continue;
            }
            let tensor = self
                .build_example(&path, augmenter.as_deref_mut())
                .with_context(|| format!("Cannot build example from {}", path.display()))?;
            debug!("Built {} ({})", row.filename, row.label);
            set.tensors.push(tensor);
            set.labels.push(row.class_index);
            set.files.push(row.filename.clone());
        }

        if set.is_empty() {
            return Err(PipelineError::config(
                "No audio files found. Check your dataset paths/metadata.",
            )
            .into());
        }
        info!("Built {} examples ({} skipped)", set.len(), set.skipped.len());
        Ok(set)
    }

    /// Load metadata, split, and build both sets.
    pub fn build(&self) -> Result<Datasets> {
        let rows = load_metadata(&self.config.metadata_csv(), &self.config.model)?;
        let split = &self.training.split;
        let (train_rows, test_rows) = stratified_split(&rows, split.test_size, split.seed);
        info!(
            "Split {} rows into {} train / {} test",
            rows.len(),
            train_rows.len(),
            test_rows.len()
        );

        let mut augmenter = self
            .training
            .augment
            .enabled
            .then(|| Augmenter::new(self.training.augment.clone(), split.seed));

        let train = self.build_set(&train_rows, augmenter.as_mut()).context("Training split")?;
        let test = self.build_set(&test_rows, None).context("Test split")?;

        let class_weights = match self.training.fit.class_weighting {
            ClassWeighting::Balanced => class_weights(&train.labels),
            ClassWeighting::None => BTreeMap::new(),
        };
        Ok(Datasets {
            train,
            test,
            class_weights,
        })
    }
}

// ── export ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct SetManifest<'a> {
    name: &'a str,
    features_file: String,
    dtype: &'static str,
    layout: &'static str,
    shape: [usize; 4],
    classes: &'a [String],
    labels: &'a [usize],
    files: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    class_weights: Option<&'a BTreeMap<usize, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fit: Option<&'a FitConfig>,
}

/// Write `<name>.features.f32` and `<name>.json` into `dir`.
///
/// Pass `fit` and `weights` for the training split only.
pub fn export_dataset(
    dir: &Path,
    name: &str,
    set: &FeatureSet,
    classes: &[String],
    fit: Option<&FitConfig>,
    weights: Option<&BTreeMap<usize, f64>>,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;

    let features_file = format!("{name}.features.f32");
    let features_path = dir.join(&features_file);
    {
        let file = fs::File::create(&features_path)
            .with_context(|| format!("Cannot create {}", features_path.display()))?;
        let mut writer = BufWriter::new(file);
        for tensor in &set.tensors {
            for v in tensor.as_slice() {
                writer.write_all(&v.to_le_bytes())?;
            }
        }
        writer.flush()?;
    }

    let manifest = SetManifest {
        name,
        features_file,
        dtype: "float32-le",
        layout: "NHWC",
        shape: set.shape(),
        classes,
        labels: &set.labels,
        files: &set.files,
        class_weights: weights,
        fit,
    };
    let manifest_path = dir.join(format!("{name}.json"));
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(&manifest_path, json)
        .with_context(|| format!("Cannot write {}", manifest_path.display()))?;

    info!(
        "Exported {} set: {:?} → {}",
        name,
        set.shape(),
        features_path.display()
    );
    Ok(manifest_path)
}

/// Export both splits.
pub fn export_datasets(
    dir: &Path,
    datasets: &Datasets,
    classes: &[String],
    training: &TrainingConfig,
) -> Result<()> {
    let weights = (!datasets.class_weights.is_empty()).then_some(&datasets.class_weights);
    export_dataset(dir, "train", &datasets.train, classes, Some(&training.fit), weights)?;
    export_dataset(dir, "test", &datasets.test, classes, None, None)?;
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use respira_common::config::CLASSES;

    fn classes() -> Vec<String> {
        CLASSES.iter().map(|c| c.to_string()).collect()
    }

    fn row(name: &str, class_index: usize) -> MetadataRow {
        MetadataRow {
            filename: name.to_string(),
            label: CLASSES[class_index].to_string(),
            class_index,
        }
    }

    fn write_wav(path: &Path, seconds: f32, sample_rate: u32, freq: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let n = (seconds * sample_rate as f32) as usize;
        for i in 0..n {
            let t = i as f32 / sample_rate as f32;
            let s = 0.5 * (2.0 * std::f32::consts::PI * freq * t).sin();
            writer.write_sample((s * 32767.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_parse_csv_line() {
        assert_eq!(parse_csv_line("a.wav,COPD"), vec!["a.wav", "COPD"]);
        assert_eq!(
            parse_csv_line("\"dir, with comma/a.wav\",\"Asthma\"\r"),
            vec!["dir, with comma/a.wav", "Asthma"]
        );
        assert_eq!(parse_csv_line("\"say \"\"hi\"\"\",x"), vec!["say \"hi\"", "x"]);
        assert_eq!(parse_csv_line("a,,b"), vec!["a", "", "b"]);
    }

    #[test]
    fn test_load_metadata_any_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("metadata.csv");
        fs::write(
            &csv,
            "patient,label,filename\n1,COPD,a.wav\n2,Flu,b.wav\n3,Normal,\"c,1.wav\"\n\n",
        )
        .unwrap();
        let rows = load_metadata(&csv, &ModelConfig::default()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], row("a.wav", 4));
        assert_eq!(rows[1].filename, "c,1.wav");
        assert_eq!(rows[1].class_index, 0);
    }

    #[test]
    fn test_load_metadata_errors_are_config_errors() {
        let dir = tempfile::tempdir().unwrap();

        let missing = load_metadata(&dir.path().join("nope.csv"), &ModelConfig::default()).unwrap_err();
        assert!(matches!(
            missing.downcast_ref::<PipelineError>(),
            Some(PipelineError::Config(_))
        ));

        let csv = dir.path().join("cols.csv");
        fs::write(&csv, "file,diagnosis\na.wav,COPD\n").unwrap();
        let err = load_metadata(&csv, &ModelConfig::default()).unwrap_err();
        assert!(err.to_string().contains("filename,label"), "got: {err}");

        let csv = dir.path().join("none.csv");
        fs::write(&csv, "filename,label\na.wav,Flu\n").unwrap();
        let err = load_metadata(&csv, &ModelConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Config(_))
        ));
    }

    #[test]
    fn test_stratified_split_counts() {
        let mut rows = Vec::new();
        for i in 0..10 {
            rows.push(row(&format!("n{i}.wav"), 0));
        }
        for i in 0..2 {
            rows.push(row(&format!("a{i}.wav"), 1));
        }
        rows.push(row("p0.wav", 2));

        let (train, test) = stratified_split(&rows, 0.2, 42);
        let count = |set: &[MetadataRow], c: usize| set.iter().filter(|r| r.class_index == c).count();
        assert_eq!(count(&test, 0), 2);
        assert_eq!(count(&test, 1), 1);
        assert_eq!(count(&test, 2), 0);
        assert_eq!(train.len() + test.len(), rows.len());

        let mut all: Vec<&str> = train.iter().chain(test.iter()).map(|r| r.filename.as_str()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), rows.len());

        let (train2, test2) = stratified_split(&rows, 0.2, 42);
        assert_eq!(train, train2);
        assert_eq!(test, test2);
    }

    #[test]
    fn test_augmenter_shift_only_is_rotation() {
        let cfg = AugmentConfig {
            enabled: true,
            gain_min: 1.0,
            gain_max: 1.0,
            max_shift: 0.1,
            noise_probability: 0.0,
            noise_std: 0.005,
        };
        let x: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let mut y = x.clone();
        Augmenter::new(cfg, 3).apply(&mut y);

        let offset = y.iter().position(|&v| v == 0.0).unwrap();
        assert!(offset <= 100 || offset >= 900, "offset {offset}");
        for (i, &v) in y.iter().enumerate() {
            assert_eq!(v, x[(i + 1000 - offset) % 1000]);
        }
    }

    #[test]
    fn test_augmenter_gain_bounds_and_determinism() {
        let cfg = AugmentConfig {
            max_shift: 0.0,
            noise_probability: 0.0,
            ..AugmentConfig::default()
        };
        let mut a = Augmenter::new(cfg.clone(), 9);
        let mut b = Augmenter::new(cfg, 9);
        for _ in 0..20 {
            let mut x = vec![1.0f32; 8];
            let mut y = vec![1.0f32; 8];
            a.apply(&mut x);
            b.apply(&mut y);
            assert_eq!(x, y);
            assert!(x.iter().all(|&g| (0.8..1.2).contains(&g)), "gain {}", x[0]);
        }
    }

    #[test]
    fn test_augmenter_noise_is_small() {
        let cfg = AugmentConfig {
            gain_min: 1.0,
            gain_max: 1.0,
            max_shift: 0.0,
            noise_probability: 1.0,
            noise_std: 0.005,
            enabled: true,
        };
        let mut x = vec![0.0f32; 20000];
        Augmenter::new(cfg, 1).apply(&mut x);
        let mean = x.iter().map(|&v| v as f64).sum::<f64>() / x.len() as f64;
        let std = (x.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / x.len() as f64).sqrt();
        assert!(mean.abs() < 5e-4, "mean {mean}");
        assert!((std - 0.005).abs() < 5e-4, "std {std}");
    }

    #[test]
    fn test_class_weights_balanced() {
        let w = class_weights(&[0, 0, 0, 1]);
        assert_eq!(w.len(), 2);
        assert!((w[&0] - 4.0 / 6.0).abs() < 1e-12);
        assert!((w[&1] - 2.0).abs() < 1e-12);
        assert!(class_weights(&[]).is_empty());
    }

    #[test]
    fn test_build_set_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_dir = dir.path().join("ds");
        fs::create_dir_all(dataset_dir.join("audio")).unwrap();
        write_wav(&dataset_dir.join("audio").join("a.wav"), 0.5, 8000, 300.0);
        write_wav(&dataset_dir.join("audio").join("b.wav"), 0.5, 16000, 900.0);

        let config = Config {
            dataset_dir: dataset_dir.clone(),
            ..Config::default()
        };
        let training = TrainingConfig::default();
        let builder = DatasetBuilder::new(&config, &training);

        let rows = vec![row("a.wav", 0), row("missing.wav", 1), row("b.wav", 4)];
        let mut aug = Augmenter::new(training.augment.clone(), 42);
        let set = builder.build_set(&rows, Some(&mut aug)).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.labels, vec![0, 4]);
        assert_eq!(set.skipped, vec!["missing.wav".to_string()]);
        assert_eq!(set.shape(), [2, 128, 376, 2]);
        assert!(set.tensors.iter().all(|t| t.is_finite()));

        let out = dir.path().join("out");
        let weights = class_weights(&set.labels);
        let manifest = export_dataset(&out, "train", &set, &classes(), Some(&training.fit), Some(&weights))
            .unwrap();
        let bytes = fs::metadata(out.join("train.features.f32")).unwrap().len();
        assert_eq!(bytes, (2 * 128 * 376 * 2 * 4) as u64);

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(manifest).unwrap()).unwrap();
        assert_eq!(json["shape"], serde_json::json!([2, 128, 376, 2]));
        assert_eq!(json["labels"], serde_json::json!([0, 4]));
        assert_eq!(json["fit"]["epochs"], 60);
        assert!(json["class_weights"].is_object());
    }

    #[test]
    fn test_unaugmented_example_matches_inference_features() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.wav");
        write_wav(&path, 1.0, 16000, 440.0);

        let config = Config::default();
        let training = TrainingConfig::default();
        let builder = DatasetBuilder::new(&config, &training);
        let from_builder = builder.build_example(&path, None).unwrap();

        let pipeline = FeaturePipeline::new(&config);
        let wave = pipeline
            .preprocessor()
            .run_bytes(&fs::read(&path).unwrap(), None)
            .unwrap();
        let (from_inference, _) = pipeline.extract(&wave).unwrap();
        assert_eq!(from_builder, from_inference);
    }

    #[test]
    fn test_build_set_all_missing_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dataset_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let training = TrainingConfig::default();
        let builder = DatasetBuilder::new(&config, &training);
        let err = builder.build_set(&[row("gone.wav", 0)], None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Config(_))
        ));
    }
}
