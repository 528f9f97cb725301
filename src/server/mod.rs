//! HTTP and WebSocket surface

pub mod error;
pub mod handlers;
pub mod websocket;

pub use error::{ApiError, ApiResult};

use crate::workspace::WorkspaceManager;
use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WorkspaceManager>,
    pub api_url: String,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(manager: Arc<WorkspaceManager>, api_url: impl Into<String>, max_upload_bytes: u64) -> Self {
        Self {
            manager,
            api_url: api_url.into(),
            max_upload_bytes: usize::try_from(max_upload_bytes).unwrap_or(usize::MAX),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let upload_limit = state.max_upload_bytes;

    Router::new()
        .route("/config", get(handlers::get_config))
        .route("/health", get(handlers::health))
        .route("/analyze", post(handlers::analyze))
        .route(
            "/analyze/archive",
            post(handlers::analyze_archive).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/export/file", post(handlers::export_file))
        .route("/export/text", post(handlers::export_text))
        .route("/ws/{session_id}", get(websocket::websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    info!("Server on {} stopped", addr);
    Ok(())
}
