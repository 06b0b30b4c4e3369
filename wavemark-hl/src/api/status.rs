//! Worker status endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::coordinator::StatusSnapshot;
use crate::AppState;

/// Worker status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Coordinator counters and queue depths
    #[serde(flatten)]
    pub coordinator: StatusSnapshot,
    /// Names of models currently published in the registry
    pub loaded_models: Vec<String>,
}

/// GET /status
///
/// Coordinator counters plus the published model set.
pub async fn worker_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        coordinator: state.coordinator.status(),
        loaded_models: state.registry.model_names().await,
    })
}

/// Build worker status routes
pub fn status_routes() -> Router<AppState> {
    Router::new().route("/status", get(worker_status))
}
