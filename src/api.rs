// src/api.rs
//! Read-only status endpoint.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::ingest::runner::FeedStatus;
use crate::ingest::scheduler::StatusBoard;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub board: StatusBoard,
}

/// `/health`, `/feeds` and `/metrics`.
pub fn router(board: StatusBoard, metrics: &Metrics) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/feeds", get(feeds))
        .with_state(AppState { board })
        .merge(metrics.router())
}

/// 200 while every feed is running; 503 once any feed has halted.
async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.board.any_halted() {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    } else {
        (StatusCode::OK, "ok")
    }
}

async fn feeds(State(state): State<AppState>) -> Json<Vec<FeedStatus>> {
    Json(state.board.snapshot())
}

/// Serve until `cancel` fires.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "status endpoint listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
