//! HTTP surface for webhook ingestion, checkout and operations.
//!
//! Webhooks are authenticated, deduplicated through an idempotency claim
//! and handed to the job queue; a [`processors::Worker`] does the rest.
//! Checkout runs inline through the saga. Structured logging comes from
//! `tracing`, metrics are exported for Prometheus.

pub mod config;
pub mod error;
pub mod routes;
pub mod signature;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::metrics::MetricsState;
pub use state::{AppState, Collaborators, Stores};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(MetricsState {
            handle: metrics_handle,
            app: state.clone(),
        });

    Router::new()
        .route("/health", get(routes::health::check))
        .route(
            "/webhooks/messaging",
            get(routes::messaging::verify).post(routes::messaging::receive),
        )
        .route("/webhooks/payments", post(routes::payments::receive))
        .route(
            "/webhooks/payments/{gateway}",
            post(routes::payments::receive),
        )
        .route("/checkout", post(routes::checkout::create))
        .route("/sagas/{id}", get(routes::checkout::get_saga))
        .route(
            "/admin/dead-letters",
            get(routes::admin::list_dead_letters).delete(routes::admin::purge_replayed),
        )
        .route("/admin/dead-letters/{id}", get(routes::admin::get_dead_letter))
        .route(
            "/admin/dead-letters/{id}/replay",
            post(routes::admin::replay_dead_letter),
        )
        .route("/admin/circuits", get(routes::admin::circuits))
        .route("/admin/jobs/{id}", get(routes::admin::get_job))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates application state over in-memory stores and collaborators.
pub fn create_default_state(config: Config) -> (Arc<AppState>, Collaborators) {
    let collaborators = Collaborators::default();
    let state = state::build_state(config, Stores::in_memory(), &collaborators);
    (state, collaborators)
}
