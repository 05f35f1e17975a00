//! HTTP observability surface over a shared [`Engine`].

use std::sync::Arc;

use axum::{
    http::{header, HeaderName},
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::engine::Engine;

pub mod health;
pub mod metrics;
pub mod status;

pub type ApiState = Arc<Engine>;

/// Responses describe live engine state and must not be cached by clients.
pub(crate) const NO_STORE: (HeaderName, &str) = (header::CACHE_CONTROL, "no-store");

pub fn create_router(engine: ApiState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/cache/stats", get(status::cache_stats))
        .route("/sync/status", get(status::sync_status))
        .route("/sync", post(status::force_sync_all))
        .route("/sync/:name", post(status::force_sync))
        .route("/sources/:name/metrics", get(status::source_metrics))
        .route("/summary", get(status::summary))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}
