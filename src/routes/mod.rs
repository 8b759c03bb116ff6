//! API Routes
//!
//! - `/api/research/start` - Start a research session
//! - `/api/research/stream/{session_id}` - Server-sent event stream of a session
//! - `/api/research/cancel/{session_id}` - Cancel a session
//! - `/api/research/sessions` - Session summaries and snapshots
//! - `/api/health` - Health check

pub mod health;
pub mod research;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::apply_cors;
use crate::models::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let origins = state.config.server.cors_allowed_origins.clone();
    let router = Router::new()
        .merge(research::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http());

    apply_cors(router, &origins)
}
