//! Checkout trigger and saga inspection.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::SagaId;
use saga::{CheckoutFailure, CheckoutRequest, SagaExecution, SagaResult};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    #[default]
    Saga,
    Locked,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutParams {
    #[serde(default)]
    pub mode: CheckoutMode,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub order_id: Option<String>,
    pub next_action: Option<CheckoutFailure>,
    pub message: Option<&'static str>,
    #[serde(flatten)]
    pub result: SagaResult,
}

impl From<SagaResult> for CheckoutResponse {
    fn from(result: SagaResult) -> Self {
        let failure = result.failure();
        let order_id = if result.success {
            result
                .step_output(saga::CREATE_ORDER, "order_id")
                .map(str::to_string)
        } else {
            None
        };
        Self {
            order_id,
            next_action: failure,
            message: failure.map(|f| f.message()),
            result,
        }
    }
}

fn failure_status(failure: Option<CheckoutFailure>) -> StatusCode {
    match failure {
        None => StatusCode::CREATED,
        Some(CheckoutFailure::ReviewCart) => StatusCode::CONFLICT,
        Some(CheckoutFailure::RetryPayment) => StatusCode::PAYMENT_REQUIRED,
        Some(CheckoutFailure::TryAgainLater) => StatusCode::SERVICE_UNAVAILABLE,
        Some(CheckoutFailure::ContactSupport) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /checkout: runs the checkout saga to completion.
///
/// `?mode=locked` uses the lock-based flow instead.
#[tracing::instrument(skip(state, request), fields(customer_id = %request.customer_id))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CheckoutParams>,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), ApiError> {
    let result = match params.mode {
        CheckoutMode::Saga => state.checkout.execute(request).await?,
        CheckoutMode::Locked => state.locked_checkout.execute(request).await?,
    };
    let response = CheckoutResponse::from(result);
    Ok((failure_status(response.next_action), Json(response)))
}

/// GET /sagas/{id}
pub async fn get_saga(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaExecution>, ApiError> {
    let saga_id =
        SagaId::parse(&id).map_err(|e| ApiError::BadRequest(format!("invalid id: {e}")))?;
    state
        .checkout
        .get(saga_id)
        .await?
        .map(Json)
        .ok_or(ApiError::Saga(saga::SagaError::NotFound(saga_id)))
}
