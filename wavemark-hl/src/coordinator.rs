//! Job coordinator
//!
//! Drives the pipeline end-to-end: pull → extract → classify → submit.
//! A pool of executors each owns one job at a time; ownership transfers
//! exclusively to the executor that pulled it until a terminal outcome.
//! An in-flight id set enforces at most one active attempt per job, and
//! retryable failures re-queue the job with exponential backoff up to the
//! configured attempt limit.

use crate::engine::ClassificationEngine;
use crate::extractor::{ExtractError, ExtractorClient};
use crate::queue::{
    FailureRecord, Job, JobErrorKind, JobOutcome, JobSource, JobState, ResultSink,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wavemark_common::config::WorkerConfig;
use wavemark_common::events::{EventBus, WorkerEvent};

/// Submission attempts per outcome before giving up
const SUBMIT_ATTEMPTS: u32 = 3;
/// Upper bound on any single backoff sleep
const BACKOFF_CAP_MS: u64 = 30_000;

/// Retryable job waiting out its backoff before re-pull
struct RetryEntry {
    due: Instant,
    job: Job,
}

/// Terminal and in-flight counters, shared with the status API
#[derive(Default)]
pub struct WorkerStatus {
    attempts_started: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed_permanent: AtomicU64,
    jobs_cancelled: AtomicU64,
    retries_scheduled: AtomicU64,
}

/// Point-in-time view of coordinator state
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Job attempts started since startup
    pub attempts_started: u64,
    /// Jobs that reached SUCCEEDED
    pub jobs_succeeded: u64,
    /// Jobs that reached FAILED_PERMANENT
    pub jobs_failed_permanent: u64,
    /// Jobs abandoned by cancellation
    pub jobs_cancelled: u64,
    /// Retries scheduled after retryable failures
    pub retries_scheduled: u64,
    /// Jobs currently owned by an executor
    pub in_flight: usize,
    /// Retryable jobs waiting out their backoff
    pub awaiting_retry: usize,
}

/// Pulls jobs, drives extraction and classification, reports outcomes
pub struct JobCoordinator {
    config: WorkerConfig,
    extractor: ExtractorClient,
    engine: ClassificationEngine,
    source: Arc<dyn JobSource>,
    sink: Arc<dyn ResultSink>,
    event_bus: EventBus,
    status: WorkerStatus,
    in_flight: Mutex<HashSet<Uuid>>,
    retry_queue: Mutex<VecDeque<RetryEntry>>,
    cancel_tokens: Mutex<HashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
}

impl JobCoordinator {
    /// Create a coordinator; all policy arrives through `config`
    pub fn new(
        config: WorkerConfig,
        extractor: ExtractorClient,
        engine: ClassificationEngine,
        source: Arc<dyn JobSource>,
        sink: Arc<dyn ResultSink>,
        event_bus: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            extractor,
            engine,
            source,
            sink,
            event_bus,
            status: WorkerStatus::default(),
            in_flight: Mutex::new(HashSet::new()),
            retry_queue: Mutex::new(VecDeque::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token that stops the executor pool between pulls
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current counters and queue depths
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            attempts_started: self.status.attempts_started.load(Ordering::Relaxed),
            jobs_succeeded: self.status.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed_permanent: self.status.jobs_failed_permanent.load(Ordering::Relaxed),
            jobs_cancelled: self.status.jobs_cancelled.load(Ordering::Relaxed),
            retries_scheduled: self.status.retries_scheduled.load(Ordering::Relaxed),
            in_flight: self.in_flight.lock().unwrap().len(),
            awaiting_retry: self.retry_queue.lock().unwrap().len(),
        }
    }

    /// Run the executor pool until shutdown is requested
    pub async fn run(self: Arc<Self>) {
        info!(
            workers = self.config.worker_count,
            max_attempts = self.config.max_attempts,
            "Starting job coordinator"
        );

        let mut handles = Vec::with_capacity(self.config.worker_count);
        for index in 0..self.config.worker_count {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(async move { this.worker_loop(index).await }));
        }
        futures::future::join_all(handles).await;

        info!("Job coordinator stopped");
    }

    /// Cancel a job by id
    ///
    /// An in-flight job has its extractor subprocess killed and is marked
    /// abandoned; a job waiting out a retry backoff is removed and
    /// reported as cancelled. Returns false for unknown ids.
    pub async fn cancel_job(&self, job_id: Uuid) -> bool {
        if let Some(token) = self.cancel_tokens.lock().unwrap().get(&job_id) {
            token.cancel();
            return true;
        }

        let removed = {
            let mut queue = self.retry_queue.lock().unwrap();
            let pos = queue.iter().position(|entry| entry.job.id == job_id);
            pos.and_then(|pos| queue.remove(pos))
        };
        match removed {
            Some(entry) => {
                // Between pulls there is no subprocess or temp file to clean
                self.abandon(entry.job).await;
                true
            }
            None => false,
        }
    }

    /// Claim exclusive ownership of a job id
    ///
    /// Returns false when an attempt for the same id is already in flight;
    /// the caller must not process the job in that case.
    pub fn try_claim(&self, job_id: Uuid) -> bool {
        self.in_flight.lock().unwrap().insert(job_id)
    }

    /// Release ownership after a terminal transition or re-queue
    pub fn release(&self, job_id: Uuid) {
        self.in_flight.lock().unwrap().remove(&job_id);
    }

    async fn worker_loop(self: Arc<Self>, worker_index: usize) {
        debug!(worker = worker_index, "Executor started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.next_job().await {
                Some(job) => self.process(job).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!(worker = worker_index, "Executor stopped");
    }

    /// Due retries take priority over fresh pulls
    async fn next_job(&self) -> Option<Job> {
        {
            let mut queue = self.retry_queue.lock().unwrap();
            let now = Instant::now();
            if let Some(pos) = queue.iter().position(|entry| entry.due <= now) {
                return queue.remove(pos).map(|entry| {
                    let mut job = entry.job;
                    job.state = JobState::Pending;
                    job
                });
            }
        }
        self.source.pull().await
    }

    /// Process one job attempt end-to-end
    async fn process(&self, mut job: Job) {
        if !self.try_claim(job.id) {
            // Another executor still owns this id. The job has already been
            // removed from its source, so dropping it here would lose it;
            // defer it for another pull once the owner releases the claim.
            warn!(job_id = %job.id, "Job already in progress, deferring pull");
            self.retry_queue.lock().unwrap().push_back(RetryEntry {
                due: Instant::now() + Duration::from_millis(self.config.poll_interval_ms),
                job,
            });
            return;
        }
        let job_id = job.id;

        job.attempt += 1;
        job.state = JobState::InProgress;
        self.status.attempts_started.fetch_add(1, Ordering::Relaxed);

        info!(
            job_id = %job_id,
            attempt = job.attempt,
            audio = %job.audio_ref.display(),
            "Job attempt started"
        );
        self.event_bus.emit_lossy(WorkerEvent::JobStarted {
            job_id,
            attempt: job.attempt,
            timestamp: chrono::Utc::now(),
        });

        let cancel = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .unwrap()
            .insert(job_id, cancel.clone());

        let started = Instant::now();
        let extraction = self.extractor.extract(&job.audio_ref, &cancel).await;
        self.cancel_tokens.lock().unwrap().remove(&job_id);

        match extraction {
            Ok(doc) => {
                self.event_bus.emit_lossy(WorkerEvent::ExtractionCompleted {
                    job_id,
                    extractor_version: doc.extractor_version.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });

                let models = if job.models.is_empty() {
                    self.config.default_models.clone()
                } else {
                    job.models.clone()
                };
                let classification = self.engine.classify(&doc, &models).await;

                if classification.succeeded() == 0 && !models.is_empty() {
                    self.handle_failure(
                        job,
                        JobErrorKind::ZeroModelsSucceeded,
                        "every requested model failed".to_string(),
                    )
                    .await;
                } else {
                    self.succeed(job, classification).await;
                }
            }
            Err(ExtractError::Cancelled) => self.abandon(job).await,
            Err(e) => {
                let kind = match &e {
                    ExtractError::InputUnreadable(_) => JobErrorKind::InputUnreadable,
                    ExtractError::ExtractorCrashed(_) => JobErrorKind::ExtractorCrashed,
                    ExtractError::ExtractorTimeout { .. } => JobErrorKind::ExtractorTimeout,
                    ExtractError::SchemaMismatch { .. } => JobErrorKind::SchemaMismatch,
                    ExtractError::Cancelled => unreachable!("handled above"),
                };
                self.handle_failure(job, kind, e.to_string()).await;
            }
        }

        self.release(job_id);
    }

    /// Job reached SUCCEEDED: submit the result, failures riding along
    async fn succeed(&self, mut job: Job, classification: crate::engine::Classification) {
        job.state = JobState::Succeeded;
        self.status.jobs_succeeded.fetch_add(1, Ordering::Relaxed);

        info!(
            job_id = %job.id,
            attempts = job.attempt,
            models_succeeded = classification.succeeded(),
            models_failed = classification.failures.len(),
            "Job succeeded"
        );
        self.event_bus.emit_lossy(WorkerEvent::JobSucceeded {
            job_id: job.id,
            attempts: job.attempt,
            models_succeeded: classification.succeeded(),
            models_failed: classification.failures.len(),
            timestamp: chrono::Utc::now(),
        });

        self.submit_with_retry(
            job.id,
            JobOutcome::Completed {
                result: classification.result,
                model_failures: classification.failures,
                attempts: job.attempt,
            },
        )
        .await;
    }

    /// Route a failed attempt: re-queue with backoff or fail permanently
    async fn handle_failure(&self, mut job: Job, kind: JobErrorKind, message: String) {
        if kind.is_retryable() && job.attempt < self.config.max_attempts {
            let backoff = self.backoff_for(job.attempt);
            self.status.retries_scheduled.fetch_add(1, Ordering::Relaxed);

            warn!(
                job_id = %job.id,
                attempt = job.attempt,
                error = %kind,
                backoff_ms = backoff.as_millis() as u64,
                "Job attempt failed, will retry"
            );
            self.event_bus.emit_lossy(WorkerEvent::JobRetrying {
                job_id: job.id,
                attempt: job.attempt,
                error: message,
                backoff_ms: backoff.as_millis() as u64,
            });

            // Holds FailedRetryable until the backoff elapses; next_job
            // moves it back to Pending when it becomes due
            job.state = JobState::FailedRetryable;
            self.retry_queue.lock().unwrap().push_back(RetryEntry {
                due: Instant::now() + backoff,
                job,
            });
        } else {
            self.fail_permanent(job, kind, message).await;
        }
    }

    /// Job reached FAILED_PERMANENT: surface a failure record, never drop silently
    async fn fail_permanent(&self, mut job: Job, kind: JobErrorKind, message: String) {
        job.state = JobState::FailedPermanent;
        self.status
            .jobs_failed_permanent
            .fetch_add(1, Ordering::Relaxed);

        error!(
            job_id = %job.id,
            attempts = job.attempt,
            error = %kind,
            detail = %message,
            "Job failed permanently"
        );
        self.event_bus.emit_lossy(WorkerEvent::JobFailedPermanent {
            job_id: job.id,
            attempts: job.attempt,
            error: kind.to_string(),
            timestamp: chrono::Utc::now(),
        });

        self.submit_with_retry(
            job.id,
            JobOutcome::Failed(FailureRecord {
                job_id: job.id,
                kind,
                message,
                attempts: job.attempt,
                failed_at: chrono::Utc::now(),
            }),
        )
        .await;
    }

    /// Cancelled job: subprocess already killed, temp files already cleaned
    async fn abandon(&self, mut job: Job) {
        job.state = JobState::FailedPermanent;
        self.status.jobs_cancelled.fetch_add(1, Ordering::Relaxed);

        info!(job_id = %job.id, "Job cancelled and abandoned");
        self.event_bus.emit_lossy(WorkerEvent::JobCancelled {
            job_id: job.id,
            timestamp: chrono::Utc::now(),
        });

        self.submit_with_retry(
            job.id,
            JobOutcome::Failed(FailureRecord {
                job_id: job.id,
                kind: JobErrorKind::Cancelled,
                message: "cancelled".to_string(),
                attempts: job.attempt,
                failed_at: chrono::Utc::now(),
            }),
        )
        .await;
    }

    /// Submit an outcome, retrying on missing ack
    ///
    /// The work itself already succeeded or terminally failed, so this
    /// retry loop is independent of the job attempt count. A missing ack
    /// means the outcome is in an unknown state; resubmitting is the only
    /// safe interpretation.
    async fn submit_with_retry(&self, job_id: Uuid, outcome: JobOutcome) {
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);
        for attempt in 1..=SUBMIT_ATTEMPTS {
            match self.sink.submit(job_id, outcome.clone()).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(job_id = %job_id, attempt, "Outcome submitted after retry");
                    }
                    return;
                }
                Err(e) if attempt < SUBMIT_ATTEMPTS => {
                    warn!(
                        job_id = %job_id,
                        attempt,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Outcome submission not acknowledged, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(BACKOFF_CAP_MS));
                }
                Err(e) => {
                    error!(
                        job_id = %job_id,
                        attempts = SUBMIT_ATTEMPTS,
                        error = %e,
                        "Outcome submission failed, giving up"
                    );
                }
            }
        }
    }

    /// Exponential backoff: base doubled per consumed attempt, capped
    fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(
            self.config
                .retry_backoff_ms
                .saturating_mul(factor)
                .min(BACKOFF_CAP_MS),
        )
    }
}
