//! sheetload-server library interface
//!
//! Exposes the router so route tests can drive it without a socket.

pub mod api;
pub mod error;
pub mod logging;

pub use crate::error::{ApiError, ApiResult};

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use sheetload::IngestService;
use tower_http::trace::TraceLayer;

/// Largest request body accepted by the upload routes.
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<IngestService>,
    /// Service startup timestamp for uptime reporting
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(service: Arc<IngestService>) -> Self {
        Self {
            service,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::ingest_routes())
        .merge(api::job_routes())
        .merge(api::analytics_routes())
        .merge(api::table_routes())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
