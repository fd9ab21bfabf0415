use crate::error::ShimError;
use crate::Result;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared counters, updated by the interception layer, the proxy handler
/// and the tile cache.
#[derive(Debug, Default)]
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub rewritten_requests: AtomicU64,
    pub blocked_scripts: AtomicU64,
    pub blocked_interactions: AtomicU64,
    pub sanitized_payloads: AtomicU64,
    pub tile_cache_hits: AtomicU64,
    pub tile_cache_misses: AtomicU64,
    pub tile_cache_stale_fallbacks: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub rewritten_requests: u64,
    pub blocked_scripts: u64,
    pub blocked_interactions: u64,
    pub sanitized_payloads: u64,
    pub tile_cache: TileCacheMetrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TileCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub stale_fallbacks: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rewritten_requests: self.rewritten_requests.load(Ordering::Relaxed),
            blocked_scripts: self.blocked_scripts.load(Ordering::Relaxed),
            blocked_interactions: self.blocked_interactions.load(Ordering::Relaxed),
            sanitized_payloads: self.sanitized_payloads.load(Ordering::Relaxed),
            tile_cache: TileCacheMetrics {
                hits: self.tile_cache_hits.load(Ordering::Relaxed),
                misses: self.tile_cache_misses.load(Ordering::Relaxed),
                stale_fallbacks: self.tile_cache_stale_fallbacks.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

pub fn admin_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_admin_server(port: u16, metrics: Arc<Metrics>) -> Result<()> {
    let app = admin_router(metrics);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        ShimError::Configuration(format!("Failed to bind admin port {}: {}", port, e))
    })?;

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Json<MetricsSnapshot> {
    Json(metrics.snapshot())
}
