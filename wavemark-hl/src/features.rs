//! Low-level feature documents
//!
//! A `FeatureDocument` is the immutable output of one extractor run: a
//! mapping from feature name to scalar/vector/text value, tagged with the
//! wire schema version and the extractor version that produced it.
//! Consumers reject unsupported schema versions instead of guessing at
//! field meanings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Feature document schema version this worker understands
pub const SUPPORTED_SCHEMA_VERSION: u32 = 3;

/// Feature document errors
#[derive(Debug, Error)]
pub enum FeatureError {
    /// Output was not a valid feature document
    #[error("Malformed feature document: {0}")]
    Malformed(String),

    /// Document declares a schema version this worker does not understand
    #[error("Unsupported feature schema version {found} (supported: {supported})")]
    SchemaMismatch {
        /// Version declared by the document
        found: u32,
        /// Version this worker understands
        supported: u32,
    },
}

/// A single feature value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Scalar descriptor (tempo, loudness, ...)
    Scalar(f64),
    /// Vector descriptor (MFCC bands, chroma, ...)
    Vector(Vec<f64>),
    /// Textual descriptor (key, scale, ...)
    Text(String),
}

/// Immutable low-level feature document
///
/// Created once per audio input by the feature source adapter and consumed
/// read-only by the classification engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDocument {
    /// Wire schema version, checked against [`SUPPORTED_SCHEMA_VERSION`]
    pub schema_version: u32,
    /// Version tag of the extractor binary that produced this document
    pub extractor_version: String,
    /// Feature name → value (sorted map for stable iteration)
    pub features: BTreeMap<String, FeatureValue>,
}

impl FeatureDocument {
    /// Parse a feature document from extractor JSON output
    ///
    /// Rejects documents whose declared schema version differs from the
    /// supported one. Malformed JSON or a missing version tag is reported
    /// as `Malformed` (the extractor produced garbage, not a mismatch).
    pub fn from_json(raw: &str) -> Result<Self, FeatureError> {
        let doc: FeatureDocument =
            serde_json::from_str(raw).map_err(|e| FeatureError::Malformed(e.to_string()))?;

        if doc.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(FeatureError::SchemaMismatch {
                found: doc.schema_version,
                supported: SUPPORTED_SCHEMA_VERSION,
            });
        }

        if doc.extractor_version.trim().is_empty() {
            return Err(FeatureError::Malformed(
                "missing extractor_version tag".to_string(),
            ));
        }

        Ok(doc)
    }

    /// Look up a scalar input for a model
    ///
    /// `index` addresses one component of a vector feature; a scalar
    /// feature is addressed with `index = None`. Returns None for missing
    /// features, out-of-range indices, and textual values.
    pub fn scalar_at(&self, name: &str, index: Option<usize>) -> Option<f64> {
        match (self.features.get(name), index) {
            (Some(FeatureValue::Scalar(v)), None) => Some(*v),
            (Some(FeatureValue::Vector(vs)), Some(i)) => vs.get(i).copied(),
            _ => None,
        }
    }

    /// Number of features in the document
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// True when the document carries no features
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}
