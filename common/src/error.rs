//! Error taxonomy shared by every pipeline stage.
//!
//! Stage functions return [`PipelineError`] unrecovered; the caller at the
//! pipeline entry point decides how to present it.

use thiserror::Error;

/// Failure of a pipeline stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Unreadable, empty, truncated or unsupported audio.
    #[error("invalid audio: {0}")]
    Decode(String),

    /// Missing or malformed configuration / dataset metadata.
    #[error("configuration error: {0}")]
    Config(String),

    /// A persisted model disagrees with the shape the pipeline produces.
    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: String,
        expected: String,
        found: String,
    },

    /// The classifier failed to execute.
    #[error("inference failed: {0}")]
    Inference(String),

    /// Filesystem failure while reading or persisting the model artifact.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn inference(msg: impl Into<String>) -> Self {
        Self::Inference(msg.into())
    }

    pub fn shape_mismatch(
        what: impl Into<String>,
        expected: impl std::fmt::Debug,
        found: impl std::fmt::Debug,
    ) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected: format!("{expected:?}"),
            found: format!("{found:?}"),
        }
    }

    /// True for failures caused by the uploaded audio itself.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    /// Human-readable message for the serving boundary.
    ///
    /// Decode failures name the problem with the upload; everything else is
    /// a generic prediction failure carrying the top-level message only.
    pub fn client_message(&self) -> String {
        match self {
            Self::Decode(msg) => format!("Invalid audio: {msg}"),
            other => format!("Prediction failed: {other}"),
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_decode() {
        let e = PipelineError::decode("empty buffer");
        assert!(e.is_client_error());
        assert_eq!(e.client_message(), "Invalid audio: empty buffer");
    }

    #[test]
    fn test_shape_mismatch_display() {
        let e = PipelineError::shape_mismatch("model input", [128, 376, 2], [96, 511, 2]);
        let msg = e.to_string();
        assert!(msg.contains("[128, 376, 2]"), "got: {msg}");
        assert!(msg.contains("[96, 511, 2]"), "got: {msg}");
        assert!(!e.is_client_error());
        assert!(e.client_message().starts_with("Prediction failed"));
    }
}
