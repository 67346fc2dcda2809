use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::handlers::{health_handler, metrics_handler, rooms_handler};
use crate::registry::RoomRegistry;
use crate::storage::{MemoryRegionStore, RedisRegionStore, SharedRegionStore};
use crate::websocket::websocket_handler;

pub struct AppState {
    pub registry: RoomRegistry,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/rooms", get(rooms_handler))
        .route("/ws/:room", get(websocket_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn connect_store(redis_url: Option<&str>) -> Result<SharedRegionStore> {
    match redis_url {
        Some(url) => {
            let store = RedisRegionStore::new(url)
                .await
                .context("failed to connect to redis")?;
            let store: SharedRegionStore = Arc::new(store);
            Ok(store)
        }
        None => {
            warn!("no redis url configured; region content is kept in memory only");
            let store: SharedRegionStore = MemoryRegionStore::new();
            Ok(store)
        }
    }
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let store = connect_store(config.redis_url.as_deref()).await?;
    let state = Arc::new(AppState {
        registry: RoomRegistry::new(store, config.room_settings()),
        metrics: Some(metrics),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("canvas-road listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
