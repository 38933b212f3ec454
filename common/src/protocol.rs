//! Boundary types: the JSON records a serving layer returns to clients.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::PipelineError;

/// Successful prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub predicted_disease: String,
    /// Percent, 2 decimals.
    pub confidence: f64,
    /// Label → percent, 4 decimals, in class order.
    pub probabilities: ProbabilityMap,
    pub visualizations: Visualizations,
}

/// Lossy payload for client-side rendering only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Visualizations {
    pub sample_rate: u32,
    pub waveform: Vec<f32>,
    /// `[mel_bin][frame]`, log-mel dB.
    pub mel_spectrogram: Vec<Vec<f32>>,
}

/// Failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl From<&PipelineError> for ErrorResponse {
    fn from(err: &PipelineError) -> Self {
        Self {
            error: err.client_message(),
        }
    }
}

/// Ordered label → value map.  Serializes as a JSON object whose keys keep
/// the insertion (class) order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbabilityMap(Vec<(String, f64)>);

impl ProbabilityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>, value: f64) {
        let label = label.into();
        match self.0.iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 = value,
            None => self.0.push((label, value)),
        }
    }

    pub fn get(&self, label: &str) -> Option<f64> {
        self.0.iter().find(|(l, _)| l == label).map(|(_, v)| *v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(l, _)| l.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(l, v)| (l.as_str(), *v))
    }

    pub fn total(&self) -> f64 {
        self.0.iter().map(|(_, v)| v).sum()
    }
}

impl FromIterator<(String, f64)> for ProbabilityMap {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (label, value) in iter {
            map.insert(label, value);
        }
        map
    }
}

impl Serialize for ProbabilityMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, value) in &self.0 {
            map.serialize_entry(label, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ProbabilityMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MapVisitor;

        impl<'de> Visitor<'de> for MapVisitor {
            type Value = ProbabilityMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of label to probability")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = ProbabilityMap::new();
                while let Some((label, value)) = access.next_entry::<String, f64>()? {
                    map.insert(label, value);
                }
                Ok(map)
            }
        }

        deserializer.deserialize_map(MapVisitor)
    }
}

/// Round to `decimals` places using the exact binary value, ties to even.
///
/// `2.675` is stored just below the tie and rounds down to `2.67`.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    if !value.is_finite() || decimals < 0 {
        let scale = 10f64.powi(decimals);
        return (value * scale).round() / scale;
    }
    format!("{value:.prec$}", prec = decimals as usize)
        .parse()
        .unwrap_or(value)
}
