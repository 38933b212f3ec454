//! Respira processing – features, classifier and prediction pipeline for
//! respiratory-sound recordings, plus the training-set builder.

pub mod analysis;
pub mod cnn;
pub mod dataset;
pub mod features;
pub mod mel;
pub mod model;
pub mod result;
pub mod training;
