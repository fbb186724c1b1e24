//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use reliability::CircuitState;

use crate::state::AppState;

#[derive(Clone)]
pub struct MetricsState {
    pub handle: PrometheusHandle,
    pub app: Arc<AppState>,
}

/// GET /metrics: returns Prometheus-formatted metrics.
///
/// Breaker states are sampled at scrape time as `circuit_state`
/// (0 closed, 1 half-open, 2 open).
pub async fn get(State(state): State<MetricsState>) -> impl IntoResponse {
    for snapshot in state.app.breakers.snapshots() {
        let value = match snapshot.state {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        metrics::gauge!("circuit_state", "service" => snapshot.service_id).set(value);
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.handle.render(),
    )
}
