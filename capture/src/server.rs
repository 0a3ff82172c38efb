//! HTTP status server for the capture agent.
//!
//! Routes:
//!   GET  /api/health     → health check
//!   GET  /api/captures   → capture / save counters

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::agent::{AgentStats, StatsSnapshot};

/// Health-check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
}

/// Shared state for route handlers.
#[derive(Clone)]
struct AppState {
    stats: Arc<AgentStats>,
    start_time: Instant,
}

fn router(stats: Arc<AgentStats>) -> Router {
    let state = AppState {
        stats,
        start_time: Instant::now(),
    };

    Router::new()
        .route("/api/health", get(health))
        .route("/api/captures", get(captures))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(
    stats: Arc<AgentStats>,
    listen_addr: String,
    shutdown: &'static AtomicBool,
) -> anyhow::Result<()> {
    let app = router(stats);

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Status server listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn captures(State(state): State<AppState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}
