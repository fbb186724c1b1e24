//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use store::JobStatus;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Jobs waiting to run, when the job store could be reached.
    pub pending_jobs: Option<u64>,
}

/// GET /health: returns system health status.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    match state.jobs.count_by_status(JobStatus::Pending).await {
        Ok(pending) => Json(HealthResponse {
            status: "ok",
            pending_jobs: Some(pending),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "health check could not reach job store");
            Json(HealthResponse {
                status: "degraded",
                pending_jobs: None,
            })
        }
    }
}
