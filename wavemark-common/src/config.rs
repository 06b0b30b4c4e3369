//! Configuration loading and resolution
//!
//! Worker configuration follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file at a platform-dependent default path
//! 4. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Worker configuration consumed by the coordinator at startup
///
/// Everything the pipeline needs is injected through this structure;
/// no module reads ambient global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path to the native low-level extractor binary
    pub extractor_path: PathBuf,
    /// Optional extractor profile/configuration file passed as third argument
    pub extractor_profile: Option<PathBuf>,
    /// Hard wall-clock timeout for one extraction, in seconds
    pub extractor_timeout_secs: u64,
    /// Optional directory of cached feature documents (keyed by audio stem)
    pub cache_dir: Option<PathBuf>,
    /// Directory of model artifacts loaded at startup
    pub model_dir: PathBuf,
    /// Models requested for jobs that don't name their own set
    pub default_models: Vec<String>,
    /// Number of parallel job executors
    pub worker_count: usize,
    /// Maximum attempts per job before FAILED_PERMANENT
    pub max_attempts: u32,
    /// Base retry backoff in milliseconds (doubled per attempt, capped)
    pub retry_backoff_ms: u64,
    /// Idle sleep between pulls when the job source is empty, in milliseconds
    pub poll_interval_ms: u64,
    /// Bind address for the status HTTP surface
    pub bind_addr: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            extractor_path: PathBuf::from("streaming_extractor_music"),
            extractor_profile: None,
            extractor_timeout_secs: 120,
            cache_dir: None,
            model_dir: PathBuf::from("models"),
            default_models: Vec::new(),
            worker_count: 4,
            max_attempts: 3,
            retry_backoff_ms: 500,
            poll_interval_ms: 1000,
            bind_addr: "127.0.0.1:5740".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Validate configuration invariants before handing it to the coordinator
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if self.extractor_timeout_secs == 0 {
            return Err(Error::Config(
                "extractor_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read config failed ({}): {}", path.display(), e)))?;
        let config: WorkerConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Parse config failed ({}): {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }
}

/// Resolve the configuration file path following the priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. Platform default location (user config dir, then /etc on Linux)
///
/// Returns None when no candidate exists; callers fall back to
/// `WorkerConfig::default()` in that case.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        return Some(PathBuf::from(path));
    }

    // Priority 3: Platform default locations
    if let Some(user_config) = dirs::config_dir().map(|d| d.join("wavemark").join("wavemark-hl.toml")) {
        if user_config.exists() {
            return Some(user_config);
        }
    }
    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/wavemark/wavemark-hl.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Load the worker configuration, logging where it came from
///
/// A resolvable path that fails to parse is an error; a completely absent
/// config file falls back to compiled defaults with a warning.
pub fn load_worker_config(cli_arg: Option<&Path>, env_var_name: &str) -> Result<WorkerConfig> {
    match resolve_config_path(cli_arg, env_var_name) {
        Some(path) => {
            let config = WorkerConfig::from_file(&path)?;
            info!("Configuration loaded from {}", path.display());
            Ok(config)
        }
        None => {
            warn!("No configuration file found, using compiled defaults");
            let config = WorkerConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.worker_count, 4);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = WorkerConfig {
            worker_count: 0,
            ..WorkerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wavemark-hl.toml");
        std::fs::write(
            &path,
            r#"
extractor_path = "/usr/local/bin/streaming_extractor_music"
extractor_timeout_secs = 30
default_models = ["mood_happy", "genre_rock"]
"#,
        )
        .unwrap();

        let config = WorkerConfig::from_file(&path).unwrap();
        assert_eq!(config.extractor_timeout_secs, 30);
        assert_eq!(config.default_models, vec!["mood_happy", "genre_rock"]);
        // Unspecified fields keep compiled defaults
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_cli_arg_wins_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("explicit.toml");
        std::fs::write(&path, "worker_count = 2\n").unwrap();

        let resolved = resolve_config_path(Some(&path), "WAVEMARK_TEST_CONFIG_UNSET");
        assert_eq!(resolved, Some(path));
    }
}
