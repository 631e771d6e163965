mod auth;
mod batching;
mod config;
mod db;
mod errors;
mod metrics;
mod model;
mod reconcile;
mod rest;
mod store;
mod validate;

use axum::{routing::get, Router};
use config::Config;
use db::PgStore;
use reconcile::Reconciler;
use rest::AppState;
use std::sync::Arc;
use store::Store;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Octa-Solar ingestor");
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.redacted_database_url());
    metrics::init_metrics();

    let pool = match db::make_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let batcher_store = store.clone();
    let (batch_size, batch_timeout_ms) = (config.batch_size, config.batch_timeout_ms);
    let batcher_handle = tokio::spawn(async move {
        batching::run_batcher(rx, batcher_store, batch_size, batch_timeout_ms).await;
    });

    let reconciler = Reconciler::new(store.clone(), config.freshness_window_secs);
    info!(
        "Freshness window: {}s, default actuator: {}",
        reconciler.window().num_seconds(),
        config.default_actuator_id
    );

    let state = AppState {
        reconciler,
        store,
        tx,
        default_device_id: config.default_device_id.clone(),
        default_actuator_id: config.default_actuator_id.clone(),
        session_ttl_secs: config.session_ttl_secs,
    };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = batcher_handle => {
            error!("Batcher task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
