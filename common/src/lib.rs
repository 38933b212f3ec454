//! Shared building blocks of the respiratory-sound pipeline: configuration,
//! errors, decoding and the waveform conditioning stages.

pub mod audio;
pub mod config;
pub mod error;
pub mod preprocess;
pub mod protocol;
pub mod stft;

pub use error::{PipelineError, Result};
