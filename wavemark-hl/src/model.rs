//! High-level model artifacts
//!
//! A model is an opaque pre-trained classifier stored as a JSON artifact:
//! a lightweight header (format tag, format version, name, version,
//! expected feature schema version) followed by the trained parameters
//! (class labels, input feature references, per-class weight rows,
//! biases). The header is validated on load and a mismatch fails fast;
//! nothing half-loaded ever reaches the registry.
//!
//! Prediction is a deterministic linear decision followed by a softmax,
//! so the same feature document and model version always reproduce the
//! same probabilities.

use crate::features::{FeatureDocument, SUPPORTED_SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Format tag every artifact must carry in its header
pub const MODEL_FORMAT_TAG: &str = "wavemark-model";
/// Artifact format version this worker understands
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Probability-sum tolerance for a well-formed prediction
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// Model artifact loading errors
#[derive(Debug, Error)]
pub enum ModelLoadError {
    /// Artifact file unreadable
    #[error("Model file unreadable: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact is not valid JSON of the expected shape
    #[error("Malformed model artifact: {0}")]
    Malformed(String),

    /// Header validation failed (format tag, versions, parameter shapes)
    #[error("Invalid model header: {0}")]
    Header(String),
}

/// Prediction errors (per-model, never fatal to the whole job)
#[derive(Debug, Error)]
pub enum PredictError {
    /// Required input feature missing from the document or not numeric
    #[error("Missing or non-numeric input feature: {0}")]
    MissingFeature(String),

    /// Input feature value is NaN or infinite
    #[error("Non-finite input feature: {0}")]
    NonFiniteFeature(String),
}

/// Reference to one scalar model input inside a feature document
///
/// `index` selects a component of a vector feature; scalar features leave
/// it unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRef {
    /// Feature name in the document
    pub feature: String,
    /// Component index for vector features
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl std::fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(i) => write!(f, "{}[{}]", self.feature, i),
            None => write!(f, "{}", self.feature),
        }
    }
}

/// On-disk artifact layout
#[derive(Debug, Deserialize)]
struct ModelArtifact {
    format: String,
    format_version: u32,
    name: String,
    version: String,
    schema_version: u32,
    classes: Vec<String>,
    inputs: Vec<FeatureRef>,
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

/// Ordered class label → probability mapping
///
/// Probabilities are in [0, 1] and sum to 1 within
/// [`PROBABILITY_TOLERANCE`]. Produced fresh per prediction, never
/// mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassProbabilities {
    entries: Vec<(String, f64)>,
}

impl ClassProbabilities {
    fn new(entries: Vec<(String, f64)>) -> Self {
        Self { entries }
    }

    /// Iterate label/probability pairs in model class order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(label, p)| (label.as_str(), *p))
    }

    /// Probability for one class label
    pub fn probability(&self, label: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, p)| *p)
    }

    /// Label with the highest probability
    pub fn top(&self) -> Option<(&str, f64)> {
        self.entries
            .iter()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(label, p)| (label.as_str(), *p))
    }

    /// Number of classes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no classes are present (never the case for loaded models)
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all probabilities (1 ± tolerance for valid predictions)
    pub fn sum(&self) -> f64 {
        self.entries.iter().map(|(_, p)| p).sum()
    }
}

/// A loaded, immutable high-level model
///
/// Owned by the registry behind an Arc; predictions borrow it read-only.
#[derive(Debug)]
pub struct Model {
    name: String,
    version: String,
    classes: Vec<String>,
    inputs: Vec<FeatureRef>,
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

impl Model {
    /// Parse and validate an artifact from JSON
    pub fn from_json(raw: &str) -> Result<Self, ModelLoadError> {
        let artifact: ModelArtifact =
            serde_json::from_str(raw).map_err(|e| ModelLoadError::Malformed(e.to_string()))?;
        Self::from_artifact(artifact)
    }

    /// Load and validate an artifact file
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    fn from_artifact(artifact: ModelArtifact) -> Result<Self, ModelLoadError> {
        if artifact.format != MODEL_FORMAT_TAG {
            return Err(ModelLoadError::Header(format!(
                "unknown format tag '{}' (expected '{}')",
                artifact.format, MODEL_FORMAT_TAG
            )));
        }
        if artifact.format_version != MODEL_FORMAT_VERSION {
            return Err(ModelLoadError::Header(format!(
                "unsupported format version {} (supported: {})",
                artifact.format_version, MODEL_FORMAT_VERSION
            )));
        }
        if artifact.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(ModelLoadError::Header(format!(
                "model expects feature schema {} (worker supports {})",
                artifact.schema_version, SUPPORTED_SCHEMA_VERSION
            )));
        }
        if artifact.name.trim().is_empty() {
            return Err(ModelLoadError::Header("empty model name".to_string()));
        }
        if artifact.classes.is_empty() {
            return Err(ModelLoadError::Header("no class labels".to_string()));
        }
        if artifact.weights.len() != artifact.classes.len() {
            return Err(ModelLoadError::Header(format!(
                "{} weight rows for {} classes",
                artifact.weights.len(),
                artifact.classes.len()
            )));
        }
        if artifact.biases.len() != artifact.classes.len() {
            return Err(ModelLoadError::Header(format!(
                "{} biases for {} classes",
                artifact.biases.len(),
                artifact.classes.len()
            )));
        }
        for (i, row) in artifact.weights.iter().enumerate() {
            if row.len() != artifact.inputs.len() {
                return Err(ModelLoadError::Header(format!(
                    "weight row {} has {} entries for {} inputs",
                    i,
                    row.len(),
                    artifact.inputs.len()
                )));
            }
        }
        let finite = artifact
            .weights
            .iter()
            .flatten()
            .chain(artifact.biases.iter())
            .all(|v| v.is_finite());
        if !finite {
            return Err(ModelLoadError::Header(
                "non-finite weight or bias".to_string(),
            ));
        }

        Ok(Self {
            name: artifact.name,
            version: artifact.version,
            classes: artifact.classes,
            inputs: artifact.inputs,
            weights: artifact.weights,
            biases: artifact.biases,
        })
    }

    /// Logical model name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Artifact version tag
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Class labels in decision order
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Predict class probabilities for a feature document
    ///
    /// Deterministic: linear per-class scores followed by a numerically
    /// stable softmax. A missing or non-finite input aborts this model's
    /// prediction only.
    pub fn predict(&self, doc: &FeatureDocument) -> Result<ClassProbabilities, PredictError> {
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for input_ref in &self.inputs {
            let value = doc
                .scalar_at(&input_ref.feature, input_ref.index)
                .ok_or_else(|| PredictError::MissingFeature(input_ref.to_string()))?;
            if !value.is_finite() {
                return Err(PredictError::NonFiniteFeature(input_ref.to_string()));
            }
            inputs.push(value);
        }

        let scores: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.biases)
            .map(|(row, bias)| {
                row.iter()
                    .zip(&inputs)
                    .map(|(w, x)| w * x)
                    .sum::<f64>()
                    + bias
            })
            .collect();

        // Softmax with max subtraction to keep exponentials bounded
        let max_score = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = scores.iter().map(|s| (s - max_score).exp()).collect();
        let norm: f64 = exps.iter().sum();

        let entries = self
            .classes
            .iter()
            .zip(&exps)
            .map(|(label, e)| (label.clone(), e / norm))
            .collect();

        Ok(ClassProbabilities::new(entries))
    }
}
