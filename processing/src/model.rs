//! Classifier loading, lazy bootstrap and inference.
//!
//! Three on-disk formats are understood, chosen by extension:
//!
//! | extension | backend |
//! |---|---|
//! | `.json` | native [`RespiratoryCnn`] (serde_json) |
//! | `.onnx` | `tract-onnx` |
//! | `.tflite` | `tract-tflite` |
//!
//! Only the native format can be created on the fly.  [`ensure`] writes a
//! fresh model to a temp file in the target directory and persists it with
//! no-clobber semantics: when several callers race, exactly one file wins
//! and the losers load it.

use std::fs;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tract_onnx::prelude::InferenceModelExt as _;
use tract_tflite::prelude::*;
use tracing::{debug, info};

use respira_common::config::Config;
use respira_common::error::{PipelineError, Result};

use crate::cnn::{RespiratoryCnn, INIT_SEED};
use crate::features::FeatureTensor;

// ── constants ────────────────────────────────────────────────────────────

/// TFLite FlatBuffer schema identifier at bytes 4..8.
const TFLITE_SCHEMA_ID: &[u8; 4] = b"TFL3";

/// Minimum plausible size for a real TFLite model (header + at least one
/// tensor).  Anything smaller is almost certainly corrupt or truncated.
const MIN_TFLITE_SIZE: u64 = 1024;

// ── public types ─────────────────────────────────────────────────────────

/// Input/output contract between the pipeline and the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelShape {
    /// `[H, W, C]` of one example (batch dimension excluded).
    pub input: [usize; 3],
    pub num_classes: usize,
}

impl ModelShape {
    /// Shape produced by the pipeline under `config`.
    pub fn from_config(config: &Config) -> Self {
        let samples = config.audio.target_len(config.audio.target_sr);
        Self {
            input: [
                config.features.n_mels,
                config.features.frame_count(samples),
                config.model.input_channels,
            ],
            num_classes: config.model.num_classes(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    Native,
    Onnx,
    Tflite,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") => Ok(Self::Native),
            Some("onnx") => Ok(Self::Onnx),
            Some("tflite") => Ok(Self::Tflite),
            _ => Err(PipelineError::inference(format!(
                "unsupported model file {} (expected .json, .onnx or .tflite)",
                path.display()
            ))),
        }
    }
}

enum Backend {
    Native(RespiratoryCnn),
    Tract(TypedRunnableModel<TypedModel>),
}

/// A classifier ready for inference.
pub struct LoadedModel {
    backend: Backend,
    format: ModelFormat,
    shape: ModelShape,
    path: PathBuf,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("format", &self.format)
            .field("shape", &self.shape)
            .field("path", &self.path)
            .finish()
    }
}

// ── bootstrap ────────────────────────────────────────────────────────────

/// Load the model at `path`, creating an untrained native model first when
/// the file does not exist.
pub fn ensure(path: &Path, shape: ModelShape) -> Result<LoadedModel> {
    if path.exists() {
        return load(path, shape);
    }
    match ModelFormat::from_path(path)? {
        ModelFormat::Native => create_native(path, shape),
        other => Err(PipelineError::inference(format!(
            "{other:?} model not found at {} and only native models can be created",
            path.display()
        ))),
    }
}

fn create_native(path: &Path, shape: ModelShape) -> Result<LoadedModel> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let model = RespiratoryCnn::untrained(shape.input, shape.num_classes, INIT_SEED);

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer(&mut writer, &model).map_err(std::io::Error::from)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;

    match tmp.persist_noclobber(path) {
        Ok(_) => {
            info!(
                "Created untrained model at {} (input {:?}, {} classes)",
                path.display(),
                shape.input,
                shape.num_classes
            );
            Ok(LoadedModel {
                backend: Backend::Native(model),
                format: ModelFormat::Native,
                shape,
                path: path.to_path_buf(),
            })
        }
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
            info!("Model at {} was created concurrently, loading it", path.display());
            load(path, shape)
        }
        Err(e) => Err(PipelineError::Io(e.error)),
    }
}

// ── model loading ────────────────────────────────────────────────────────

/// Load an existing model and check it against `shape`.
pub fn load(path: &Path, shape: ModelShape) -> Result<LoadedModel> {
    let format = ModelFormat::from_path(path)?;
    let backend = match format {
        ModelFormat::Native => Backend::Native(load_native(path, shape)?),
        ModelFormat::Onnx => {
            info!("Loading ONNX classifier from {}", path.display());
            let runner = load_onnx_runner(path)?;
            check_tract_facts(&runner, shape)?;
            Backend::Tract(runner)
        }
        ModelFormat::Tflite => {
            let runner = load_tflite_runner(path)?;
            check_tract_facts(&runner, shape)?;
            Backend::Tract(runner)
        }
    };
    Ok(LoadedModel {
        backend,
        format,
        shape,
        path: path.to_path_buf(),
    })
}

fn load_native(path: &Path, shape: ModelShape) -> Result<RespiratoryCnn> {
    let bytes = fs::read(path)?;
    let model: RespiratoryCnn = serde_json::from_slice(&bytes).map_err(|e| {
        PipelineError::inference(format!("corrupt model file {}: {e}", path.display()))
    })?;
    model.validate()?;
    if model.input_shape != shape.input {
        return Err(PipelineError::shape_mismatch(
            "model input",
            shape.input,
            model.input_shape,
        ));
    }
    if model.num_classes != shape.num_classes {
        return Err(PipelineError::shape_mismatch(
            "model classes",
            shape.num_classes,
            model.num_classes,
        ));
    }
    info!("Loaded native model from {}", path.display());
    Ok(model)
}

/// Validate a TFLite file *before* handing it to tract.
///
/// Checks performed (cheapest first):
///   1. File is not empty / not suspiciously small
///   2. File is not accidentally a zip archive or HTML error page
///   3. FlatBuffer identifier bytes == `TFL3`
///   4. Root offset (first 4 bytes, little-endian u32) points inside the file
fn validate_tflite_file(path: &Path) -> Result<()> {
    let len = fs::metadata(path)?.len();
    if len < MIN_TFLITE_SIZE {
        return Err(PipelineError::inference(format!(
            "TFLite file is suspiciously small ({len} bytes): {}",
            path.display()
        )));
    }

    let header = {
        use std::io::Read;
        let mut f = fs::File::open(path)?;
        let mut buf = [0u8; 32];
        let n = f.read(&mut buf)?;
        buf[..n].to_vec()
    };
    if header.len() < 8 {
        return Err(PipelineError::inference(format!(
            "TFLite file too short to contain a valid header: {}",
            path.display()
        )));
    }

    if header.starts_with(b"PK\x03\x04") {
        return Err(PipelineError::inference(format!(
            "File appears to be a zip archive, not a TFLite model: {}",
            path.display()
        )));
    }
    if header.starts_with(b"<!") || header.starts_with(b"<h") || header.starts_with(b"<H") {
        return Err(PipelineError::inference(format!(
            "File appears to be an HTML page, not a TFLite model: {}",
            path.display()
        )));
    }

    if header[4..8] != *TFLITE_SCHEMA_ID {
        return Err(PipelineError::inference(format!(
            "Invalid TFLite schema identifier in {}: got {:?}",
            path.display(),
            &header[4..8]
        )));
    }

    let root_offset = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if root_offset as u64 >= len {
        return Err(PipelineError::inference(format!(
            "TFLite root table offset ({root_offset}) exceeds file size ({len} bytes) in {}",
            path.display()
        )));
    }

    info!(
        "Validated TFLite file: {} ({:.1} MB)",
        path.display(),
        len as f64 / (1024.0 * 1024.0),
    );
    Ok(())
}

/// Load and optimise a TFLite model file.
fn load_tflite_runner(path: &Path) -> Result<TypedRunnableModel<TypedModel>> {
    validate_tflite_file(path)?;
    info!("Loading TFLite model from {}", path.display());

    tract_tflite::tflite()
        .model_for_path(path)
        .and_then(|m| m.into_optimized())
        .and_then(|m| m.into_runnable())
        .map_err(|e| {
            PipelineError::inference(format!("cannot load TFLite model {}: {e:#}", path.display()))
        })
}

/// Load and optimise an ONNX model file.
fn load_onnx_runner(path: &Path) -> Result<TypedRunnableModel<TypedModel>> {
    tract_onnx::onnx()
        .model_for_path(path)
        .and_then(|m| m.into_optimized())
        .and_then(|m| m.into_runnable())
        .map_err(|e| {
            PipelineError::inference(format!("cannot load ONNX model {}: {e:#}", path.display()))
        })
}

/// Compare the model's declared input `[1, H, W, C]` and output class count
/// with `shape`.  Symbolic dimensions are accepted.
fn check_tract_facts(runner: &TypedRunnableModel<TypedModel>, shape: ModelShape) -> Result<()> {
    let model = runner.model();

    let input = model
        .input_fact(0)
        .map_err(|e| PipelineError::inference(format!("model has no input: {e:#}")))?;
    let declared: Vec<Option<i64>> = input.shape.iter().map(|d| d.to_i64().ok()).collect();
    let expected = [
        1,
        shape.input[0] as i64,
        shape.input[1] as i64,
        shape.input[2] as i64,
    ];
    let matches = declared.len() == expected.len()
        && declared
            .iter()
            .zip(expected.iter())
            .all(|(d, e)| d.map_or(true, |d| d == *e));
    if !matches {
        return Err(PipelineError::shape_mismatch("model input", expected, declared));
    }

    let output = model
        .output_fact(0)
        .map_err(|e| PipelineError::inference(format!("model has no output: {e:#}")))?;
    if let Some(Ok(classes)) = output.shape.iter().last().map(|d| d.to_i64()) {
        if classes != shape.num_classes as i64 {
            return Err(PipelineError::shape_mismatch(
                "model output classes",
                shape.num_classes,
                classes,
            ));
        }
    }
    debug!("Model facts: input {:?}, output {:?}", input, output);
    Ok(())
}

// ── inference ────────────────────────────────────────────────────────────

impl LoadedModel {
    pub fn format(&self) -> ModelFormat {
        self.format
    }

    pub fn shape(&self) -> ModelShape {
        self.shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw class scores for one feature tensor.
    pub fn predict(&self, tensor: &FeatureTensor) -> Result<Vec<f32>> {
        if tensor.shape() != self.shape.input {
            return Err(PipelineError::shape_mismatch(
                "feature tensor",
                self.shape.input,
                tensor.shape(),
            ));
        }

        let scores = match &self.backend {
            Backend::Native(model) => model.predict(tensor)?,
            Backend::Tract(runner) => {
                let [h, w, c] = self.shape.input;
                let input: Tensor =
                    tract_ndarray::Array4::from_shape_vec((1, h, w, c), tensor.as_slice().to_vec())
                        .map_err(|e| PipelineError::inference(format!("cannot shape input: {e}")))?
                        .into();
                let result = runner
                    .run(tvec![input.into()])
                    .map_err(|e| PipelineError::inference(format!("{e:#}")))?;
                let output = result
                    .first()
                    .ok_or_else(|| PipelineError::inference("model produced no output"))?
                    .to_array_view::<f32>()
                    .map_err(|e| PipelineError::inference(format!("cannot read output: {e:#}")))?;
                output.iter().copied().collect()
            }
        };

        if scores.len() != self.shape.num_classes {
            return Err(PipelineError::shape_mismatch(
                "model output",
                self.shape.num_classes,
                scores.len(),
            ));
        }
        Ok(scores)
    }
}

// ── tests ────────────────────────────────────────────────────────────────
