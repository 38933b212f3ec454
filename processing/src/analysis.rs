//! Full analysis pipeline – from uploaded audio bytes to a prediction.
//!
//! The waveform and feature stages live in [`FeaturePipeline`] so that the
//! training-set builder runs exactly the same code as live prediction.

use std::path::Path;

use tracing::{debug, info};

use respira_common::audio::{AudioFormat, Waveform};
use respira_common::config::Config;
use respira_common::error::Result;
use respira_common::preprocess::Preprocessor;
use respira_common::protocol::PredictionResponse;

use crate::features::{self, FeatureTensor};
use crate::mel::{FeatureExtractor, SpectralFeatures};
use crate::model::{self, LoadedModel, ModelShape};
use crate::result::{PredictionResult, ResultComposer};

/// Waveform conditioning plus feature extraction for one configuration.
pub struct FeaturePipeline {
    pre: Preprocessor,
    extractor: FeatureExtractor,
}

impl FeaturePipeline {
    pub fn new(config: &Config) -> Self {
        Self {
            pre: Preprocessor::new(config.audio.clone()),
            extractor: FeatureExtractor::new(&config.features, config.audio.target_sr),
        }
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.pre
    }

    /// Features of an already conditioned, fixed-length waveform.
    pub fn extract(&self, wave: &Waveform) -> Result<(FeatureTensor, SpectralFeatures)> {
        let spectral = self.extractor.extract(&wave.samples);
        let tensor = features::build_tensor(&spectral)?;
        debug!("Feature tensor {:?}", tensor.shape());
        Ok((tensor, spectral))
    }
}

/// Loaded pipeline and classifier.  Holds no mutable state; share it freely
/// across request threads.
pub struct Predictor {
    pipeline: FeaturePipeline,
    model: LoadedModel,
    composer: ResultComposer,
}

impl Predictor {
    /// Build the pipeline and `ensure` the configured model.
    pub fn new(config: &Config) -> Result<Self> {
        let model = model::ensure(&config.model_path, ModelShape::from_config(config))?;
        Ok(Self::with_model(config, model))
    }

    pub fn with_model(config: &Config, model: LoadedModel) -> Self {
        Self {
            pipeline: FeaturePipeline::new(config),
            model,
            composer: ResultComposer::new(config.model.classes.clone()),
        }
    }

    pub fn model(&self) -> &LoadedModel {
        &self.model
    }

    /// Predict from a decoded waveform at any sample rate.
    pub fn predict_waveform(&self, wave: Waveform) -> Result<PredictionResult> {
        let wave = self.pipeline.preprocessor().run(wave)?;
        let (tensor, spectral) = self.pipeline.extract(&wave)?;
        let scores = self.model.predict(&tensor)?;
        let result = self
            .composer
            .compose(&scores, &wave.samples, wave.sample_rate, &spectral.mel_db)?;
        info!("Predicted {} ({:.2}%)", result.label, result.confidence);
        Ok(result)
    }

    /// Predict from raw file bytes.
    pub fn predict_bytes(&self, bytes: &[u8], declared: Option<AudioFormat>) -> Result<PredictionResult> {
        let wave = respira_common::audio::decode(bytes, declared)?;
        self.predict_waveform(wave)
    }

    /// Single entry point for an upload: admission check, full pipeline,
    /// boundary rounding.
    pub fn predict_upload(
        &self,
        bytes: &[u8],
        content_type: Option<&str>,
        filename: Option<&str>,
    ) -> Result<PredictionResponse> {
        let format = AudioFormat::from_declared(content_type, filename)?;
        Ok(self.predict_bytes(bytes, Some(format))?.into_response())
    }

    /// Read a recording from disk and treat it as an upload named after
    /// the file, with the MIME type implied by its extension.
    pub fn predict_file(&self, path: &Path) -> Result<PredictionResponse> {
        let bytes = std::fs::read(path)?;
        let filename = path.file_name().and_then(|n| n.to_str());
        let mime = AudioFormat::from_extension(path).map(|f| f.mime());
        self.predict_upload(&bytes, mime, filename)
    }
}
