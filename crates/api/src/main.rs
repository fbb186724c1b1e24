//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use api::{Collaborators, Stores};
use store::PostgresStore;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn connect_stores(config: &Config) -> Stores {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using in-memory stores");
        return Stores::in_memory();
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .expect("failed to connect to PostgreSQL");
    let store = PostgresStore::new(pool);
    store
        .run_migrations()
        .await
        .expect("failed to run migrations");
    tracing::info!("connected to PostgreSQL");
    Stores::postgres(store)
}

#[tokio::main]
async fn main() {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(&config);

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Stores and application state
    let stores = connect_stores(&config).await;
    let addr = config.addr();
    let state = api::state::build_state(config, stores, &Collaborators::default());

    match state.breakers.load_from(state.kv.as_ref()).await {
        Ok(restored) if restored > 0 => tracing::info!(restored, "circuit breaker state restored"),
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "could not restore circuit breaker state"),
    }

    // 4. Job workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = Arc::new(state.worker());
    let worker_task = tokio::spawn(worker.run(shutdown_rx));

    // 5. Serve until a signal arrives
    let app = api::create_app(state.clone(), metrics_handle);
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 6. Drain workers and persist breaker state
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_task.await {
        tracing::error!(error = %e, "worker task failed");
    }
    if let Err(e) = state.breakers.save_to(state.kv.as_ref()).await {
        tracing::warn!(error = %e, "could not persist circuit breaker state");
    }

    tracing::info!("server shut down gracefully");
}
