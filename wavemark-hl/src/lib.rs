//! wavemark-hl library interface
//!
//! Exposes the worker's modules for integration testing and embedding.

pub mod api;
pub mod coordinator;
pub mod engine;
pub mod extractor;
pub mod features;
pub mod model;
pub mod queue;
pub mod registry;

use axum::Router;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use wavemark_common::events::{EventBus, WorkerEvent};

use crate::coordinator::JobCoordinator;
use crate::registry::ModelRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Job coordinator (counters, cancellation)
    pub coordinator: Arc<JobCoordinator>,
    /// Model registry consulted by the status surface
    pub registry: Arc<ModelRegistry>,
    /// Event bus carrying worker lifecycle events
    pub event_bus: EventBus,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
    /// Last permanent job failure for diagnostics
    pub last_error: Arc<RwLock<Option<String>>>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<JobCoordinator>,
        registry: Arc<ModelRegistry>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            coordinator,
            registry,
            event_bus,
            startup_time: Utc::now(),
            last_error: Arc::new(RwLock::new(None)),
        }
    }

    /// Keep `last_error` updated from worker events
    pub fn spawn_error_tracker(&self) {
        let mut rx = self.event_bus.subscribe();
        let last_error = Arc::clone(&self.last_error);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let WorkerEvent::JobFailedPermanent { job_id, error, .. } = event {
                    *last_error.write().await = Some(format!("job {}: {}", job_id, error));
                }
            }
        });
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::status_routes())
        .with_state(state)
}
