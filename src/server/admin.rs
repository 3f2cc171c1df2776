//! Admin HTTP API.
//!
//! - GET /health
//! - GET /v1/cache/stats
//! - GET /metrics (Prometheus text format)

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::cache::directory::{DirectoryStats, SharedDirectory};
use crate::metrics::Metrics;
use crate::server::backend::{Backend, BackendSnapshot};

/// Application state shared across handlers.
pub struct AdminState {
    pub backend: Arc<Backend>,
    pub directory: SharedDirectory,
    pub metrics: Metrics,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub stats: StatsResponse,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub backend: BackendSnapshot,
    pub switch: DirectoryStats,
}

async fn snapshot(state: &AdminState) -> StatsResponse {
    let switch = state.directory.lock().await.stats();
    StatsResponse {
        backend: state.backend.snapshot().await,
        switch,
    }
}

async fn health(State(state): State<Arc<AdminState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        stats: snapshot(&state).await,
    })
}

async fn cache_stats(State(state): State<Arc<AdminState>>) -> Json<StatsResponse> {
    Json(snapshot(&state).await)
}

async fn metrics(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to render metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
