//! Operator endpoints: dead letters, circuit breakers and jobs.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::{DeadLetterId, JobId};
use reliability::CircuitBreakerSnapshot;
use serde::{Deserialize, Serialize};
use store::{DeadLetter, DeadLetterQuery, Job};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DeadLetterParams {
    pub hook: Option<String>,
    #[serde(default)]
    pub include_replayed: bool,
    pub limit: Option<usize>,
}

fn parse_dead_letter_id(raw: &str) -> Result<DeadLetterId, ApiError> {
    DeadLetterId::parse(raw).map_err(|e| ApiError::BadRequest(format!("invalid id: {e}")))
}

/// GET /admin/dead-letters: newest first, optionally filtered by hook.
pub async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeadLetterParams>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let mut query = DeadLetterQuery {
        hook_name: params.hook,
        include_replayed: params.include_replayed,
        ..Default::default()
    };
    if let Some(limit) = params.limit {
        query.limit = limit.clamp(1, 1000);
    }
    Ok(Json(state.dead_letters.list(query).await?))
}

/// GET /admin/dead-letters/{id}
pub async fn get_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<DeadLetter>, ApiError> {
    let id = parse_dead_letter_id(&id)?;
    state
        .dead_letters
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("dead letter {id} not found")))
}

/// POST /admin/dead-letters/{id}/replay: re-enqueues with a fresh attempt budget.
#[tracing::instrument(skip(state))]
pub async fn replay_dead_letter(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let id = parse_dead_letter_id(&id)?;
    let job = state.dead_letters.replay(id).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: u64,
}

/// DELETE /admin/dead-letters: drops entries that were already replayed.
pub async fn purge_replayed(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let purged = state.dead_letters.purge_replayed().await?;
    tracing::info!(purged, "purged replayed dead letters");
    Ok(Json(PurgeResponse { purged }))
}

/// GET /admin/circuits
pub async fn circuits(State(state): State<Arc<AppState>>) -> Json<Vec<CircuitBreakerSnapshot>> {
    Json(state.breakers.snapshots())
}

/// GET /admin/jobs/{id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = JobId::parse(&id).map_err(|e| ApiError::BadRequest(format!("invalid id: {e}")))?;
    state
        .queue
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))
}
