//! Respira command line – predicts disease classes for recordings,
//! bootstraps the classifier and exports training feature sets.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use respira_common::config::{self, Config};
use respira_common::protocol::ErrorResponse;

use respira_processing::analysis::Predictor;
use respira_processing::dataset::{self, DatasetBuilder};
use respira_processing::model::{self, ModelShape};
use respira_processing::training::TrainingConfig;

#[derive(Debug, Parser)]
#[command(name = "respira")]
#[command(about = "Respiratory sound classification", long_about = None)]
struct Args {
    /// KEY=VALUE configuration file.  Built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Classify WAV/MP3 files, one JSON response per line.
    Predict {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Load the configured model, creating the baseline if absent.
    InitModel,
    /// Build and export the train/test feature sets.
    BuildDataset {
        /// Output directory.
        #[arg(long, default_value = "features")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => config::load(path)
            .with_context(|| format!("Config load failed: {}", path.display()))?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    match args.command {
        Command::Predict { files } => predict(&config, &files),
        Command::InitModel => init_model(&config),
        Command::BuildDataset { out } => build_dataset(&config, &out),
    }
}

fn predict(config: &Config, files: &[PathBuf]) -> Result<()> {
    let predictor = Predictor::new(config).context("Model load failed")?;
    let mut failed = 0usize;

    for path in files {
        let json = match predictor.predict_file(path) {
            Ok(resp) => serde_json::to_string(&resp)?,
            Err(e) => {
                warn!("{}: {e}", path.display());
                failed += 1;
                serde_json::to_string(&ErrorResponse::from(&e))?
            }
        };
        println!("{json}");
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} files failed", files.len());
    }
    Ok(())
}

fn init_model(config: &Config) -> Result<()> {
    let shape = ModelShape::from_config(config);
    let model = model::ensure(&config.model_path, shape)
        .with_context(|| format!("Cannot initialize model at {}", config.model_path.display()))?;
    info!(
        "Model ready: {} ({:?}, input {:?}, {} classes)",
        model.path().display(),
        model.format(),
        model.shape().input,
        model.shape().num_classes
    );
    Ok(())
}

fn build_dataset(config: &Config, out: &Path) -> Result<()> {
    let training = TrainingConfig::load(config.training_config.as_deref())?;
    let datasets = DatasetBuilder::new(config, &training)
        .build()
        .with_context(|| format!("Cannot build dataset from {}", config.dataset_dir.display()))?;
    dataset::export_datasets(out, &datasets, &config.model.classes, &training)?;
    info!(
        "Dataset exported to {} ({} train, {} test)",
        out.display(),
        datasets.train.len(),
        datasets.test.len()
    );
    Ok(())
}
