//! Feature source adapter
//!
//! Invokes the native low-level extractor as an isolated subprocess and
//! normalizes its output into a [`FeatureDocument`]. The extractor is an
//! opaque binary: audio path in, feature document out, exit 0 on success.
//! Running it out-of-process keeps a misbehaving extractor from taking
//! down the worker.

use crate::features::{FeatureDocument, FeatureError};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wavemark_common::config::WorkerConfig;

/// Feature extraction errors
///
/// The retryable/permanent split drives the job state machine: a defective
/// input will not get better on retry, a crashed or hung extractor might.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Audio input missing or unreadable (permanent)
    #[error("Input unreadable: {0}")]
    InputUnreadable(String),

    /// Extractor exited non-zero or produced malformed output (retryable)
    #[error("Extractor crashed: {0}")]
    ExtractorCrashed(String),

    /// Extractor exceeded the wall-clock timeout and was killed (retryable)
    #[error("Extractor timed out after {timeout_secs}s")]
    ExtractorTimeout {
        /// Configured timeout that was exceeded
        timeout_secs: u64,
    },

    /// Extractor produced a document with an unsupported schema version (permanent)
    #[error("Feature schema mismatch: document version {found}, supported {supported}")]
    SchemaMismatch {
        /// Version declared by the document
        found: u32,
        /// Version this worker understands
        supported: u32,
    },

    /// Extraction cancelled; subprocess killed and temp files removed
    #[error("Extraction cancelled")]
    Cancelled,
}

impl ExtractError {
    /// True for errors where a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExtractError::ExtractorCrashed(_) | ExtractError::ExtractorTimeout { .. }
        )
    }
}

impl From<FeatureError> for ExtractError {
    fn from(err: FeatureError) -> Self {
        match err {
            // Garbage output means the extractor misbehaved, not the input
            FeatureError::Malformed(msg) => {
                ExtractError::ExtractorCrashed(format!("malformed output: {}", msg))
            }
            FeatureError::SchemaMismatch { found, supported } => {
                ExtractError::SchemaMismatch { found, supported }
            }
        }
    }
}

/// Removes the temp output file on every exit path
struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Feature extractor client
///
/// Holds no shared locks; every call is an independent subprocess run, so
/// a multi-minute extraction never blocks other executors.
#[derive(Clone)]
pub struct ExtractorClient {
    binary_path: PathBuf,
    profile: Option<PathBuf>,
    timeout: Duration,
    cache_dir: Option<PathBuf>,
}

impl ExtractorClient {
    /// Create a client from worker configuration
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            binary_path: config.extractor_path.clone(),
            profile: config.extractor_profile.clone(),
            timeout: Duration::from_secs(config.extractor_timeout_secs),
            cache_dir: config.cache_dir.clone(),
        }
    }

    /// Create a client directly (tests, embedding)
    pub fn new(binary_path: PathBuf, timeout: Duration) -> Self {
        Self {
            binary_path,
            profile: None,
            timeout,
            cache_dir: None,
        }
    }

    /// Set the cache directory consulted before spawning the extractor
    pub fn with_cache_dir(mut self, dir: PathBuf) -> Self {
        self.cache_dir = Some(dir);
        self
    }

    /// Set the extractor profile file passed as third argument
    pub fn with_profile(mut self, profile: PathBuf) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Extract low-level features for one audio input
    ///
    /// Consults the document cache first; otherwise runs the extractor
    /// subprocess with a hard wall-clock timeout. The temporary output
    /// file is removed on every exit path. Cancellation kills the
    /// subprocess before returning.
    pub async fn extract(
        &self,
        audio_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<FeatureDocument, ExtractError> {
        // The input being unreadable is the input's fault, never the extractor's
        std::fs::metadata(audio_path)
            .map_err(|e| ExtractError::InputUnreadable(format!("{}: {}", audio_path.display(), e)))?;

        if let Some(doc) = self.cached_document(audio_path) {
            return Ok(doc);
        }

        let temp_output =
            std::env::temp_dir().join(format!("wavemark_{}.json", Uuid::new_v4()));
        let _guard = TempFileGuard(temp_output.clone());

        debug!(
            audio_file = %audio_path.display(),
            output_file = %temp_output.display(),
            "Running extractor"
        );
        let started = Instant::now();

        let mut command = Command::new(&self.binary_path);
        command
            .arg(audio_path)
            .arg(&temp_output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(profile) = &self.profile {
            command.arg(profile);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExtractError::ExtractorCrashed(format!("spawn failed: {}", e)))?;

        // Drain stderr concurrently so a chatty extractor can't deadlock on
        // a full pipe buffer
        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status
                .map_err(|e| ExtractError::ExtractorCrashed(format!("wait failed: {}", e)))?,
            _ = tokio::time::sleep(self.timeout) => {
                warn!(
                    audio_file = %audio_path.display(),
                    timeout_secs = self.timeout.as_secs(),
                    "Extractor timed out, killing subprocess"
                );
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(ExtractError::ExtractorTimeout {
                    timeout_secs: self.timeout.as_secs(),
                });
            }
            _ = cancel.cancelled() => {
                info!(audio_file = %audio_path.display(), "Extraction cancelled, killing subprocess");
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(ExtractError::Cancelled);
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(ExtractError::ExtractorCrashed(format!(
                "exit code: {:?}, stderr: {}",
                status.code(),
                stderr.trim()
            )));
        }

        let raw = tokio::fs::read_to_string(&temp_output).await.map_err(|e| {
            ExtractError::ExtractorCrashed(format!("no output document: {}", e))
        })?;

        let doc = FeatureDocument::from_json(&raw)?;

        info!(
            audio_file = %audio_path.display(),
            extractor_version = %doc.extractor_version,
            features = doc.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Extraction completed"
        );

        self.cache_document(audio_path, &raw);

        Ok(doc)
    }

    /// Look up a cached feature document for this input
    ///
    /// Unusable cache entries (malformed, wrong schema version) are treated
    /// as misses and re-extracted, never trusted silently.
    fn cached_document(&self, audio_path: &Path) -> Option<FeatureDocument> {
        let cache_path = self.cache_path(audio_path)?;
        let raw = std::fs::read_to_string(&cache_path).ok()?;
        match FeatureDocument::from_json(&raw) {
            Ok(doc) => {
                debug!(
                    audio_file = %audio_path.display(),
                    cache_file = %cache_path.display(),
                    "Using cached feature document"
                );
                Some(doc)
            }
            Err(err) => {
                warn!(
                    cache_file = %cache_path.display(),
                    error = %err,
                    "Ignoring unusable cached feature document"
                );
                None
            }
        }
    }

    /// Write-through to the document cache, best effort
    fn cache_document(&self, audio_path: &Path, raw: &str) {
        if let Some(cache_path) = self.cache_path(audio_path) {
            if let Err(e) = std::fs::write(&cache_path, raw) {
                warn!(cache_file = %cache_path.display(), error = %e, "Cache write failed");
            }
        }
    }

    /// Cache file for an audio path. Distinct recordings can share a file
    /// stem, so the key also carries a digest of the full path.
    fn cache_path(&self, audio_path: &Path) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let stem = audio_path.file_stem()?;
        let canonical =
            std::fs::canonicalize(audio_path).unwrap_or_else(|_| audio_path.to_path_buf());
        let mut digest = format!("{:x}", Sha256::digest(canonical.to_string_lossy().as_bytes()));
        digest.truncate(16);
        Some(dir.join(format!(
            "{}-{}.features.json",
            stem.to_string_lossy(),
            digest
        )))
    }

    /// Check whether the extractor binary can be spawned at all
    pub fn probe(&self) -> bool {
        std::process::Command::new(&self.binary_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }
}
