//! Job source and result sink seams
//!
//! The worker is driven by an abstract job source and reports to an
//! abstract result sink; whatever supplies jobs (queue service, datastore,
//! batch script) stays an external collaborator behind these traits. The
//! in-process [`MemoryQueue`] backs standalone runs and tests.

use crate::engine::{HighLevelResult, ModelFailure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be pulled
    Pending,
    /// Exactly one executor owns the attempt
    InProgress,
    /// Terminal: at least one model produced probabilities (or none were requested)
    Succeeded,
    /// Terminal: input defective or retries exhausted
    FailedPermanent,
    /// Attempt failed but a later one may succeed; returns to Pending
    FailedRetryable,
}

/// One unit of work: classify a single audio input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job UUID
    pub id: Uuid,
    /// Audio input path
    pub audio_ref: PathBuf,
    /// Requested model names; empty falls back to the configured default set
    pub models: Vec<String>,
    /// Attempts already consumed
    pub attempt: u32,
    /// Current lifecycle state
    pub state: JobState,
    /// When the job was created
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Job {
    /// Create a pending job for one audio input
    pub fn new(audio_ref: PathBuf, models: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            audio_ref,
            models,
            attempt: 0,
            state: JobState::Pending,
            created_at: chrono::Utc::now(),
        }
    }
}

/// Job-level error kinds reported in failure records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Audio input missing or unreadable (permanent)
    InputUnreadable,
    /// Feature document schema not understood (permanent)
    SchemaMismatch,
    /// Extractor exited non-zero or produced garbage (retryable)
    ExtractorCrashed,
    /// Extractor exceeded its wall-clock budget (retryable)
    ExtractorTimeout,
    /// Every requested model failed (retryable)
    ZeroModelsSucceeded,
    /// Job cancelled while in flight
    Cancelled,
}

impl JobErrorKind {
    /// True for kinds where a later attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobErrorKind::ExtractorCrashed
                | JobErrorKind::ExtractorTimeout
                | JobErrorKind::ZeroModelsSucceeded
        )
    }
}

impl std::fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobErrorKind::InputUnreadable => "input_unreadable",
            JobErrorKind::SchemaMismatch => "schema_mismatch",
            JobErrorKind::ExtractorCrashed => "extractor_crashed",
            JobErrorKind::ExtractorTimeout => "extractor_timeout",
            JobErrorKind::ZeroModelsSucceeded => "zero_models_succeeded",
            JobErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal failure report for a job that exhausted its options
///
/// A job never disappears silently: exhausted retries surface the last
/// error kind and the attempt count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Job UUID
    pub job_id: Uuid,
    /// Last error kind observed
    pub kind: JobErrorKind,
    /// Human-readable detail of the last error
    pub message: String,
    /// Total attempts consumed
    pub attempts: u32,
    /// When the job reached FAILED_PERMANENT
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

/// What the worker hands to the result sink for a finished job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    /// Job succeeded; per-model failures (if any) ride along
    Completed {
        /// Aggregated high-level result
        result: HighLevelResult,
        /// Models that produced no probabilities
        model_failures: Vec<ModelFailure>,
        /// Attempts consumed to reach success
        attempts: u32,
    },
    /// Job failed permanently
    Failed(FailureRecord),
}

/// Result sink submission errors
#[derive(Debug, Error)]
pub enum SinkError {
    /// Sink gave no acknowledgement; outcome delivery unknown, retry it
    #[error("Result sink did not acknowledge: {0}")]
    NoAck(String),
}

/// Supplies work items
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Pull the next pending job, or None when the source is idle
    async fn pull(&self) -> Option<Job>;
}

/// Receives finished results and failure records
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Submit a terminal outcome; Ok means acknowledged
    async fn submit(&self, job_id: Uuid, outcome: JobOutcome) -> Result<(), SinkError>;
}

/// In-process job queue and outcome store
///
/// FIFO pull order. Used by the binary's standalone mode and by tests;
/// production deployments put a real queue behind the traits instead.
#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<Job>>,
    outcomes: Mutex<Vec<(Uuid, JobOutcome)>>,
}

impl MemoryQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job at the back
    pub fn push(&self, job: Job) {
        self.pending.lock().unwrap().push_back(job);
    }

    /// Number of jobs still waiting
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Snapshot of all recorded outcomes
    pub fn outcomes(&self) -> Vec<(Uuid, JobOutcome)> {
        self.outcomes.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobSource for MemoryQueue {
    async fn pull(&self) -> Option<Job> {
        self.pending.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl ResultSink for MemoryQueue {
    async fn submit(&self, job_id: Uuid, outcome: JobOutcome) -> Result<(), SinkError> {
        self.outcomes.lock().unwrap().push((job_id, outcome));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new(PathBuf::from("track.wav"), vec!["mood_happy".to_string()]);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn test_error_kind_retryability() {
        assert!(JobErrorKind::ExtractorCrashed.is_retryable());
        assert!(JobErrorKind::ExtractorTimeout.is_retryable());
        assert!(JobErrorKind::ZeroModelsSucceeded.is_retryable());
        assert!(!JobErrorKind::InputUnreadable.is_retryable());
        assert!(!JobErrorKind::SchemaMismatch.is_retryable());
        assert!(!JobErrorKind::Cancelled.is_retryable());
    }

    #[tokio::test]
    async fn test_memory_queue_fifo_pull() {
        let queue = MemoryQueue::new();
        let first = Job::new(PathBuf::from("a.wav"), vec![]);
        let second = Job::new(PathBuf::from("b.wav"), vec![]);
        let first_id = first.id;
        queue.push(first);
        queue.push(second);

        assert_eq!(queue.pull().await.unwrap().id, first_id);
        assert_eq!(queue.pending_len(), 1);
        assert!(queue.pull().await.is_some());
        assert!(queue.pull().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_queue_records_outcomes() {
        let queue = MemoryQueue::new();
        let job_id = Uuid::new_v4();
        let record = FailureRecord {
            job_id,
            kind: JobErrorKind::InputUnreadable,
            message: "gone".to_string(),
            attempts: 1,
            failed_at: chrono::Utc::now(),
        };
        queue
            .submit(job_id, JobOutcome::Failed(record))
            .await
            .unwrap();

        let outcomes = queue.outcomes();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, job_id);
        match &outcomes[0].1 {
            JobOutcome::Failed(r) => assert_eq!(r.kind, JobErrorKind::InputUnreadable),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
