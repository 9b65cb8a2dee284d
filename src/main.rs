//! Wiring: load configuration, connect the store, build the shared relay
//! state, and serve the WebSocket endpoint until shutdown.

mod admission;
mod auth;
mod config;
mod error;
mod ingest;
mod metrics;
mod model;
mod query;
mod registry;
mod store;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;

use admission::AllowAll;
use config::Config;
use metrics::Metrics;
use registry::Registry;
use store::cache::CachingStore;
use store::postgres::PostgresStore;
use store::Store;
use ws::RelayState;

/// Bound on how long relay shutdown waits for in-flight connections and
/// store operations to drain before giving up.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    tracing::info!(bind_addr = %config.bind_addr, "starting relay");

    let postgres = PostgresStore::connect(&config.database_url, 50)
        .await
        .expect("failed to connect to database");

    let store: Arc<dyn Store> = match &config.redis_url {
        Some(redis_url) => {
            let redis_config = deadpool_redis::Config::from_url(redis_url.clone());
            let redis_pool = redis_config
                .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                .expect("failed to build redis pool");
            tracing::info!("layering Redis query cache in front of the Postgres store");
            Arc::new(CachingStore::new(postgres, redis_pool))
        }
        None => Arc::new(postgres),
    };

    let metrics = Arc::new(Metrics::new());
    let registry = Arc::new(Registry::new(metrics.clone()));
    let config = Arc::new(config);

    spawn_metrics_snapshot_task(metrics.clone());

    let state = RelayState {
        store,
        registry,
        metrics,
        admission: Arc::new(AllowAll),
        config: config.clone(),
    };

    let app = Router::new()
        .route("/", get(ws::handler))
        .with_state(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(RequestDecompressionLayer::new());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind listener");
    tracing::info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("closing store");
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, state.store.close())
        .await
        .is_err()
    {
        tracing::warn!("store close timed out during shutdown drain");
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger axum's
/// graceful shutdown, which stops accepting new connections and lets
/// in-flight upgrades finish.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
        _ = ctrl_c => { tracing::info!("received Ctrl+C, shutting down"); },
        _ = terminate => { tracing::info!("received SIGTERM, shutting down"); },
    }
}

fn spawn_metrics_snapshot_task(metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            metrics.log_snapshot();
        }
    });
}
