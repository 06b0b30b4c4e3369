//! Event types for the Wavemark worker
//!
//! Provides shared event definitions and EventBus for worker modules.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Worker event types
///
/// Events are broadcast via EventBus; the status API and tests subscribe.
/// All events use this central enum for type safety and exhaustive matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// Job attempt started (job pulled and claimed by an executor)
    JobStarted {
        /// Job UUID
        job_id: Uuid,
        /// Attempt number (1-based)
        attempt: u32,
        /// When the attempt started
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Feature extraction finished for a job attempt
    ExtractionCompleted {
        /// Job UUID
        job_id: Uuid,
        /// Extractor version tag reported in the feature document
        extractor_version: String,
        /// Wall-clock extraction time in milliseconds
        duration_ms: u64,
    },

    /// Job reached SUCCEEDED
    ///
    /// Partial classification success still counts: at least one model
    /// produced probabilities, per-model failures ride along in the result.
    JobSucceeded {
        /// Job UUID
        job_id: Uuid,
        /// Attempts consumed to reach success
        attempts: u32,
        /// Number of models that produced probabilities
        models_succeeded: usize,
        /// Number of models that failed
        models_failed: usize,
        /// When the job completed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Job attempt failed with a retryable error; job will be re-queued
    JobRetrying {
        /// Job UUID
        job_id: Uuid,
        /// Attempt that just failed
        attempt: u32,
        /// Error kind (display form)
        error: String,
        /// Backoff before the job becomes pullable again, in milliseconds
        backoff_ms: u64,
    },

    /// Job reached FAILED_PERMANENT
    JobFailedPermanent {
        /// Job UUID
        job_id: Uuid,
        /// Total attempts consumed
        attempts: u32,
        /// Last error kind (display form)
        error: String,
        /// When the job failed
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// In-flight job cancelled and abandoned
    JobCancelled {
        /// Job UUID
        job_id: Uuid,
        /// When the cancellation completed (subprocess killed, temp cleaned)
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Model published into the registry (initial load or hot reload)
    ModelPublished {
        /// Logical model name
        name: String,
        /// Artifact version tag
        version: String,
        /// True when this replaced a previously-published instance
        reloaded: bool,
    },
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for worker-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Returns a receiver that will receive all events emitted after
    /// subscription. Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: WorkerEvent,
    ) -> Result<usize, broadcast::error::SendError<WorkerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    ///
    /// Useful for progress-style events where it's acceptable if no
    /// component is currently listening.
    pub fn emit_lossy(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let job_id = Uuid::new_v4();
        bus.emit(WorkerEvent::JobStarted {
            job_id,
            attempt: 1,
            timestamp: chrono::Utc::now(),
        })
        .expect("one subscriber");

        match rx.recv().await.unwrap() {
            WorkerEvent::JobStarted { job_id: id, attempt, .. } => {
                assert_eq!(id, job_id);
                assert_eq!(attempt, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_err() {
        let bus = EventBus::new(16);
        let result = bus.emit(WorkerEvent::ModelPublished {
            name: "genre_rock".to_string(),
            version: "v1".to_string(),
            reloaded: false,
        });
        assert!(result.is_err());
        // emit_lossy must not panic in the same situation
        bus.emit_lossy(WorkerEvent::ModelPublished {
            name: "genre_rock".to_string(),
            version: "v1".to_string(),
            reloaded: true,
        });
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = WorkerEvent::JobRetrying {
            job_id: Uuid::new_v4(),
            attempt: 2,
            error: "extractor timed out".to_string(),
            backoff_ms: 1000,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"JobRetrying\""));
        let parsed: WorkerEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            WorkerEvent::JobRetrying { backoff_ms, .. } => assert_eq!(backoff_ms, 1000),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
