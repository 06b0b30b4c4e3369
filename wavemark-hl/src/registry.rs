//! Model registry
//!
//! Shared, read-mostly index of loaded models keyed by logical name.
//! Published state is a copy-on-write snapshot: readers clone the current
//! `Arc` under a brief read lock and never hold any lock while
//! predicting; load and reload build a new map and swap it atomically, so
//! in-flight predictions finish against the instance they resolved and no
//! reader can observe a partially-loaded model.

use crate::model::{Model, ModelLoadError};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use wavemark_common::events::{EventBus, WorkerEvent};

/// Consistent view of the registry at one point in time
pub type ModelSnapshot = Arc<HashMap<String, Arc<Model>>>;

/// Registry operation errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Artifact failed to load or validate; published state untouched
    #[error(transparent)]
    Load(#[from] ModelLoadError),

    /// Artifact header names a different model than the one registered
    #[error("Artifact name '{artifact}' does not match registered name '{registered}'")]
    NameMismatch {
        /// Name inside the artifact header
        artifact: String,
        /// Name the caller registered under
        registered: String,
    },

    /// load() called for a name that is already published
    #[error("Model already loaded: {0} (use reload)")]
    AlreadyLoaded(String),

    /// reload() called for a name that was never loaded
    #[error("Model not found: {0}")]
    NotFound(String),
}

/// Versioned model registry with atomic snapshot swap
pub struct ModelRegistry {
    snapshot: RwLock<ModelSnapshot>,
    event_bus: Option<EventBus>,
}

impl ModelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            event_bus: None,
        }
    }

    /// Attach an event bus for ModelPublished notifications
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Load and publish a new model
    ///
    /// Either fully succeeds and publishes, or fails and leaves the prior
    /// state (absent) untouched. A name that is already published is
    /// rejected; hot replacement goes through [`reload`](Self::reload).
    pub async fn load(&self, name: &str, path: &Path) -> Result<(), RegistryError> {
        let model = Self::read_artifact(name, path)?;

        let mut guard = self.snapshot.write().await;
        if guard.contains_key(name) {
            return Err(RegistryError::AlreadyLoaded(name.to_string()));
        }
        self.publish(&mut guard, name, model, false);
        Ok(())
    }

    /// Atomically replace a published model
    ///
    /// In-flight predictions holding the old instance complete against it;
    /// lookups after the swap see the new instance.
    pub async fn reload(&self, name: &str, path: &Path) -> Result<(), RegistryError> {
        let model = Self::read_artifact(name, path)?;

        let mut guard = self.snapshot.write().await;
        if !guard.contains_key(name) {
            return Err(RegistryError::NotFound(name.to_string()));
        }
        self.publish(&mut guard, name, model, true);
        Ok(())
    }

    /// Look up a model by name
    pub async fn get(&self, name: &str) -> Option<Arc<Model>> {
        self.snapshot.read().await.get(name).cloned()
    }

    /// Clone the current snapshot
    ///
    /// The engine resolves a whole job's model set against one snapshot so
    /// a concurrent reload can't split a single classification across
    /// model generations.
    pub async fn snapshot(&self) -> ModelSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Names of all published models, sorted
    pub async fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of published models
    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    /// True when no models are published
    pub async fn is_empty(&self) -> bool {
        self.snapshot.read().await.is_empty()
    }

    /// Bulk-load every `*.json` artifact in a directory
    ///
    /// Registers each artifact under its header name. Individual failures
    /// are logged and skipped; the directory being unreadable is an error.
    /// Returns the number of models published.
    pub async fn load_dir(&self, dir: &Path) -> std::io::Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Model::load(&path) {
                Ok(model) => {
                    let name = model.name().to_string();
                    let mut guard = self.snapshot.write().await;
                    let reloaded = guard.contains_key(&name);
                    self.publish(&mut guard, &name, model, reloaded);
                    loaded += 1;
                }
                Err(e) => {
                    warn!(
                        artifact = %path.display(),
                        error = %e,
                        "Skipping unloadable model artifact"
                    );
                }
            }
        }
        Ok(loaded)
    }

    fn read_artifact(name: &str, path: &Path) -> Result<Model, RegistryError> {
        let model = Model::load(path)?;
        if model.name() != name {
            return Err(RegistryError::NameMismatch {
                artifact: model.name().to_string(),
                registered: name.to_string(),
            });
        }
        Ok(model)
    }

    /// Swap in a new snapshot containing `model` under `name`
    fn publish(
        &self,
        guard: &mut tokio::sync::RwLockWriteGuard<'_, ModelSnapshot>,
        name: &str,
        model: Model,
        reloaded: bool,
    ) {
        let version = model.version().to_string();
        let mut next: HashMap<String, Arc<Model>> = guard.as_ref().clone();
        next.insert(name.to_string(), Arc::new(model));
        **guard = Arc::new(next);

        info!(model = %name, version = %version, reloaded, "Model published");
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(WorkerEvent::ModelPublished {
                name: name.to_string(),
                version,
                reloaded,
            });
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
