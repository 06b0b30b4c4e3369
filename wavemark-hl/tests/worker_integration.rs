//! End-to-end coordinator tests
//!
//! Drives the full pipeline (pull → extract → classify → submit) with a
//! scripted stand-in for the native extractor and the in-memory queue as
//! both job source and result sink.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;
use wavemark_common::config::WorkerConfig;
use wavemark_common::events::EventBus;
use wavemark_hl::coordinator::JobCoordinator;
use wavemark_hl::engine::{ClassificationEngine, ModelFailureKind};
use wavemark_hl::extractor::ExtractorClient;
use wavemark_hl::queue::{Job, JobErrorKind, JobOutcome, MemoryQueue};
use wavemark_hl::registry::ModelRegistry;

const VALID_DOCUMENT: &str =
    r#"{"schema_version": 3, "extractor_version": "ell-2.1", "features": {"tempo": 128.0}}"#;

fn write_stub_extractor(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("stub_extractor.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_audio(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"fake audio").unwrap();
    path
}

async fn registry_with(dir: &Path, names: &[&str]) -> Arc<ModelRegistry> {
    let registry = Arc::new(ModelRegistry::new());
    for name in names {
        let raw = format!(
            r#"{{
                "format": "wavemark-model",
                "format_version": 1,
                "name": "{}",
                "version": "v1",
                "schema_version": 3,
                "classes": ["yes", "no"],
                "inputs": [{{"feature": "tempo"}}],
                "weights": [[0.1], [-0.1]],
                "biases": [0.0, 0.0]
            }}"#,
            name
        );
        let path = dir.join(format!("{}.json", name));
        std::fs::write(&path, raw).unwrap();
        registry.load(name, &path).await.unwrap();
    }
    registry
}

fn worker_config(extractor: PathBuf) -> WorkerConfig {
    WorkerConfig {
        extractor_path: extractor,
        extractor_timeout_secs: 10,
        worker_count: 1,
        max_attempts: 3,
        retry_backoff_ms: 10,
        poll_interval_ms: 20,
        ..WorkerConfig::default()
    }
}

struct Harness {
    queue: Arc<MemoryQueue>,
    coordinator: Arc<JobCoordinator>,
}

impl Harness {
    fn start(config: WorkerConfig, registry: Arc<ModelRegistry>) -> Self {
        let queue = Arc::new(MemoryQueue::new());
        let extractor = ExtractorClient::from_config(&config);
        let coordinator = JobCoordinator::new(
            config,
            extractor,
            ClassificationEngine::new(registry),
            queue.clone(),
            queue.clone(),
            EventBus::new(64),
        );
        tokio::spawn(Arc::clone(&coordinator).run());
        Self { queue, coordinator }
    }

    async fn wait_for_outcomes(&self, count: usize) -> Vec<(Uuid, JobOutcome)> {
        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let outcomes = self.queue.outcomes();
            if outcomes.len() >= count {
                return outcomes;
            }
            assert!(
                Instant::now() < deadline,
                "timed out waiting for {} outcomes, have {}",
                count,
                outcomes.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.coordinator.shutdown_token().cancel();
    }
}

#[tokio::test]
async fn partial_model_success_still_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let audio = write_audio(dir.path(), "track.wav");
    let stub = write_stub_extractor(
        dir.path(),
        &format!("printf '%s' '{}' > \"$2\"", VALID_DOCUMENT),
    );
    // mood_happy is deliberately absent from the registry
    let registry = registry_with(dir.path(), &["genre_rock"]).await;

    let harness = Harness::start(worker_config(stub), registry);
    let job = Job::new(
        audio,
        vec!["mood_happy".to_string(), "genre_rock".to_string()],
    );
    let job_id = job.id;
    harness.queue.push(job);

    let outcomes = harness.wait_for_outcomes(1).await;
    assert_eq!(outcomes[0].0, job_id);
    match &outcomes[0].1 {
        JobOutcome::Completed {
            result,
            model_failures,
            attempts,
        } => {
            assert_eq!(*attempts, 1);
            assert_eq!(result.outputs.len(), 1);
            assert_eq!(result.outputs[0].model, "genre_rock");
            assert_eq!(model_failures.len(), 1);
            assert_eq!(model_failures[0].model, "mood_happy");
            assert_eq!(model_failures[0].kind, ModelFailureKind::ModelNotFound);
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn crash_twice_then_succeed_at_attempt_three() {
    let dir = tempfile::tempdir().unwrap();
    let audio = write_audio(dir.path(), "track.wav");
    let counter = dir.path().join("attempts");
    // Fails the first two runs, produces a valid document on the third
    let stub = write_stub_extractor(
        dir.path(),
        &format!(
            "n=$(cat {counter} 2>/dev/null || echo 0)\n\
             n=$((n+1))\n\
             echo $n > {counter}\n\
             if [ $n -lt 3 ]; then echo 'corrupt input' >&2; exit 1; fi\n\
             printf '%s' '{doc}' > \"$2\"",
            counter = counter.display(),
            doc = VALID_DOCUMENT
        ),
    );
    let registry = registry_with(dir.path(), &["genre_rock"]).await;

    let harness = Harness::start(worker_config(stub), registry);
    harness
        .queue
        .push(Job::new(audio, vec!["genre_rock".to_string()]));

    let outcomes = harness.wait_for_outcomes(1).await;
    match &outcomes[0].1 {
        JobOutcome::Completed { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(harness.coordinator.status().retries_scheduled, 2);
}

#[tokio::test]
async fn timeout_exhausts_retries_then_fails_permanently() {
    let dir = tempfile::tempdir().unwrap();
    let audio = write_audio(dir.path(), "track.wav");
    let stub = write_stub_extractor(dir.path(), "sleep 30");
    let registry = registry_with(dir.path(), &["genre_rock"]).await;

    let mut config = worker_config(stub);
    config.extractor_timeout_secs = 1;
    config.max_attempts = 2;

    let harness = Harness::start(config, registry);
    harness
        .queue
        .push(Job::new(audio, vec!["genre_rock".to_string()]));

    let outcomes = harness.wait_for_outcomes(1).await;
    match &outcomes[0].1 {
        JobOutcome::Failed(record) => {
            assert_eq!(record.kind, JobErrorKind::ExtractorTimeout);
            assert_eq!(record.attempts, 2);
        }
        other => panic!("expected permanent failure, got {:?}", other),
    }
}

#[tokio::test]
async fn unreadable_input_fails_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let stub = write_stub_extractor(
        dir.path(),
        &format!("printf '%s' '{}' > \"$2\"", VALID_DOCUMENT),
    );
    let registry = registry_with(dir.path(), &["genre_rock"]).await;

    let harness = Harness::start(worker_config(stub), registry);
    harness.queue.push(Job::new(
        PathBuf::from("/no/such/track.wav"),
        vec!["genre_rock".to_string()],
    ));

    let outcomes = harness.wait_for_outcomes(1).await;
    match &outcomes[0].1 {
        JobOutcome::Failed(record) => {
            assert_eq!(record.kind, JobErrorKind::InputUnreadable);
            assert_eq!(record.attempts, 1);
        }
        other => panic!("expected permanent failure, got {:?}", other),
    }
    assert_eq!(harness.coordinator.status().retries_scheduled, 0);
}

#[tokio::test]
async fn zero_models_succeeded_is_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let audio = write_audio(dir.path(), "track.wav");
    let stub = write_stub_extractor(
        dir.path(),
        &format!("printf '%s' '{}' > \"$2\"", VALID_DOCUMENT),
    );
    // Empty registry: the one requested model can never resolve
    let registry = Arc::new(ModelRegistry::new());

    let mut config = worker_config(stub);
    config.max_attempts = 2;

    let harness = Harness::start(config, registry);
    harness
        .queue
        .push(Job::new(audio, vec!["mood_happy".to_string()]));

    let outcomes = harness.wait_for_outcomes(1).await;
    match &outcomes[0].1 {
        JobOutcome::Failed(record) => {
            assert_eq!(record.kind, JobErrorKind::ZeroModelsSucceeded);
            assert_eq!(record.attempts, 2);
        }
        other => panic!("expected permanent failure, got {:?}", other),
    }
}

#[tokio::test]
async fn empty_model_request_is_an_idempotent_noop() {
    let dir = tempfile::tempdir().unwrap();
    let audio = write_audio(dir.path(), "track.wav");
    let stub = write_stub_extractor(
        dir.path(),
        &format!("printf '%s' '{}' > \"$2\"", VALID_DOCUMENT),
    );
    let registry = Arc::new(ModelRegistry::new());

    // No per-job models and no configured defaults
    let harness = Harness::start(worker_config(stub), registry);
    harness.queue.push(Job::new(audio, Vec::new()));

    let outcomes = harness.wait_for_outcomes(1).await;
    match &outcomes[0].1 {
        JobOutcome::Completed {
            result,
            model_failures,
            attempts,
        } => {
            assert_eq!(*attempts, 1);
            assert!(result.outputs.is_empty());
            assert!(model_failures.is_empty());
        }
        other => panic!("expected success, got {:?}", other),
    }
}

#[tokio::test]
async fn cancelling_an_in_flight_job_abandons_it() {
    let dir = tempfile::tempdir().unwrap();
    let audio = write_audio(dir.path(), "track.wav");
    let stub = write_stub_extractor(dir.path(), "sleep 30");
    let registry = Arc::new(ModelRegistry::new());

    let mut config = worker_config(stub);
    config.extractor_timeout_secs = 60;

    let harness = Harness::start(config, registry);
    let job = Job::new(audio, vec!["genre_rock".to_string()]);
    let job_id = job.id;
    harness.queue.push(job);

    // Wait until the executor owns the job, then cancel it
    let deadline = Instant::now() + Duration::from_secs(5);
    while harness.coordinator.status().in_flight == 0 {
        assert!(Instant::now() < deadline, "job never went in flight");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(harness.coordinator.cancel_job(job_id).await);

    let outcomes = harness.wait_for_outcomes(1).await;
    match &outcomes[0].1 {
        JobOutcome::Failed(record) => assert_eq!(record.kind, JobErrorKind::Cancelled),
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert_eq!(harness.coordinator.status().jobs_cancelled, 1);
}

#[tokio::test]
async fn default_model_set_applies_when_job_names_none() {
    let dir = tempfile::tempdir().unwrap();
    let audio = write_audio(dir.path(), "track.wav");
    let stub = write_stub_extractor(
        dir.path(),
        &format!("printf '%s' '{}' > \"$2\"", VALID_DOCUMENT),
    );
    let registry = registry_with(dir.path(), &["danceability"]).await;

    let mut config = worker_config(stub);
    config.default_models = vec!["danceability".to_string()];

    let harness = Harness::start(config, registry);
    harness.queue.push(Job::new(audio, Vec::new()));

    let outcomes = harness.wait_for_outcomes(1).await;
    match &outcomes[0].1 {
        JobOutcome::Completed { result, .. } => {
            assert_eq!(result.outputs.len(), 1);
            assert_eq!(result.outputs[0].model, "danceability");
        }
        other => panic!("expected success, got {:?}", other),
    }
}
