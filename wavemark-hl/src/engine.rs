//! Classification engine
//!
//! Runs a feature document through the requested set of high-level models
//! and assembles the per-model probabilities into a single structured
//! result. Per-model failure isolation: one model being absent or choking
//! on the document never aborts classification of the remaining models;
//! partial results are valid and reported as such. No cross-model voting
//! or blending happens here; every model's output is independent.

use crate::features::FeatureDocument;
use crate::model::ClassProbabilities;
use crate::registry::ModelRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why a single model produced no probabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum ModelFailureKind {
    /// Requested model is not published in the registry
    ModelNotFound,
    /// Model rejected the document (missing/non-finite input features)
    PredictionError(String),
}

/// One failed model within an otherwise valid classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFailure {
    /// Requested model name
    pub model: String,
    /// Failure kind
    pub kind: ModelFailureKind,
}

/// Output of one successfully-run model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelOutput {
    /// Logical model name
    pub model: String,
    /// Artifact version the prediction ran against
    pub model_version: String,
    /// Class label → probability, in model class order
    pub probabilities: ClassProbabilities,
}

/// Structured high-level classification result
///
/// Exactly one output per successfully-run model, in request order.
/// Failed models are listed in the sibling failure list of
/// [`Classification`], never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighLevelResult {
    /// Per-model outputs in request order
    pub outputs: Vec<ModelOutput>,
    /// Version tag of the extractor that produced the input document
    pub extractor_version: String,
    /// Feature schema version of the input document
    pub schema_version: u32,
    /// When classification completed
    pub computed_at: chrono::DateTime<chrono::Utc>,
}

impl HighLevelResult {
    /// Output for one model, if it succeeded
    pub fn output(&self, model: &str) -> Option<&ModelOutput> {
        self.outputs.iter().find(|o| o.model == model)
    }
}

/// Classification outcome: result plus per-model failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    /// Aggregated result for the models that ran
    pub result: HighLevelResult,
    /// Models that produced no probabilities, with reasons
    pub failures: Vec<ModelFailure>,
}

impl Classification {
    /// Number of models that produced probabilities
    pub fn succeeded(&self) -> usize {
        self.result.outputs.len()
    }
}

/// Classification engine over a shared model registry
#[derive(Clone)]
pub struct ClassificationEngine {
    registry: Arc<ModelRegistry>,
}

impl ClassificationEngine {
    /// Create an engine backed by a registry
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    /// Classify a feature document with the requested models
    ///
    /// Duplicate names collapse to their first occurrence; request order
    /// is preserved in the result. Models run sequentially to keep one
    /// job's CPU use bounded when many executors classify concurrently.
    /// An empty request yields an empty result and no failures.
    pub async fn classify(&self, doc: &FeatureDocument, model_names: &[String]) -> Classification {
        // One snapshot for the whole job: a concurrent reload can't split a
        // classification across model generations
        let snapshot = self.registry.snapshot().await;

        let mut outputs = Vec::new();
        let mut failures = Vec::new();
        let mut seen = HashSet::new();

        for name in model_names {
            if !seen.insert(name.as_str()) {
                continue;
            }

            let Some(model) = snapshot.get(name.as_str()) else {
                warn!(model = %name, "Requested model not found in registry");
                failures.push(ModelFailure {
                    model: name.clone(),
                    kind: ModelFailureKind::ModelNotFound,
                });
                continue;
            };

            match model.predict(doc) {
                Ok(probabilities) => {
                    debug!(model = %name, version = %model.version(), "Prediction completed");
                    outputs.push(ModelOutput {
                        model: name.clone(),
                        model_version: model.version().to_string(),
                        probabilities,
                    });
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "Prediction failed");
                    failures.push(ModelFailure {
                        model: name.clone(),
                        kind: ModelFailureKind::PredictionError(e.to_string()),
                    });
                }
            }
        }

        info!(
            requested = seen.len(),
            succeeded = outputs.len(),
            failed = failures.len(),
            "Classification complete"
        );

        Classification {
            result: HighLevelResult {
                outputs,
                extractor_version: doc.extractor_version.clone(),
                schema_version: doc.schema_version,
                computed_at: chrono::Utc::now(),
            },
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn write_artifact(dir: &Path, name: &str, inputs: &str, weights: &str) -> PathBuf {
        let raw = format!(
            r#"{{
                "format": "wavemark-model",
                "format_version": 1,
                "name": "{}",
                "version": "v1",
                "schema_version": 3,
                "classes": ["yes", "no"],
                "inputs": {},
                "weights": {},
                "biases": [0.0, 0.0]
            }}"#,
            name, inputs, weights
        );
        let path = dir.join(format!("{}.json", name));
        std::fs::write(&path, raw).unwrap();
        path
    }

    fn sample_doc() -> FeatureDocument {
        FeatureDocument::from_json(
            r#"{
                "schema_version": 3,
                "extractor_version": "ell-2.1",
                "features": {"tempo": 128.0, "mfcc": [12.1, -3.4, 0.5]}
            }"#,
        )
        .unwrap()
    }

    async fn registry_with_models(dir: &Path, names: &[&str]) -> Arc<ModelRegistry> {
        let registry = Arc::new(ModelRegistry::new());
        for name in names {
            let path = write_artifact(dir, name, r#"[{"feature": "tempo"}]"#, "[[0.1], [-0.1]]");
            registry.load(name, &path).await.unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_empty_model_set_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_models(dir.path(), &["mood_happy"]).await;
        let engine = ClassificationEngine::new(registry);

        let classification = engine.classify(&sample_doc(), &[]).await;
        assert!(classification.result.outputs.is_empty());
        assert!(classification.failures.is_empty());
    }

    #[tokio::test]
    async fn test_missing_model_yields_partial_result() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_models(dir.path(), &["genre_rock"]).await;
        let engine = ClassificationEngine::new(registry);

        let requested = vec!["mood_happy".to_string(), "genre_rock".to_string()];
        let classification = engine.classify(&sample_doc(), &requested).await;

        assert_eq!(classification.succeeded(), 1);
        assert!(classification.result.output("genre_rock").is_some());
        assert_eq!(classification.failures.len(), 1);
        assert_eq!(classification.failures[0].model, "mood_happy");
        assert_eq!(
            classification.failures[0].kind,
            ModelFailureKind::ModelNotFound
        );
    }

    #[tokio::test]
    async fn test_prediction_error_does_not_abort_remaining_models() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ModelRegistry::new());
        // First model needs a feature the document lacks
        let bad = write_artifact(
            dir.path(),
            "needs_chroma",
            r#"[{"feature": "chroma", "index": 0}]"#,
            "[[1.0], [-1.0]]",
        );
        registry.load("needs_chroma", &bad).await.unwrap();
        let good = write_artifact(
            dir.path(),
            "mood_happy",
            r#"[{"feature": "tempo"}]"#,
            "[[0.1], [-0.1]]",
        );
        registry.load("mood_happy", &good).await.unwrap();

        let engine = ClassificationEngine::new(registry);
        let requested = vec!["needs_chroma".to_string(), "mood_happy".to_string()];
        let classification = engine.classify(&sample_doc(), &requested).await;

        assert_eq!(classification.succeeded(), 1);
        assert!(matches!(
            classification.failures[0].kind,
            ModelFailureKind::PredictionError(_)
        ));
    }

    #[tokio::test]
    async fn test_request_order_preserved_and_duplicates_collapsed() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            registry_with_models(dir.path(), &["danceability", "genre_rock", "mood_happy"]).await;
        let engine = ClassificationEngine::new(registry);

        let requested = vec![
            "mood_happy".to_string(),
            "danceability".to_string(),
            "mood_happy".to_string(),
            "genre_rock".to_string(),
        ];
        let classification = engine.classify(&sample_doc(), &requested).await;

        let order: Vec<&str> = classification
            .result
            .outputs
            .iter()
            .map(|o| o.model.as_str())
            .collect();
        assert_eq!(order, vec!["mood_happy", "danceability", "genre_rock"]);
    }

    #[tokio::test]
    async fn test_result_metadata_carries_versions() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_with_models(dir.path(), &["mood_happy"]).await;
        let engine = ClassificationEngine::new(registry);

        let classification = engine
            .classify(&sample_doc(), &["mood_happy".to_string()])
            .await;
        assert_eq!(classification.result.extractor_version, "ell-2.1");
        assert_eq!(classification.result.schema_version, 3);
        assert_eq!(classification.result.outputs[0].model_version, "v1");
    }
}
