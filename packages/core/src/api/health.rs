use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use super::{ApiState, NO_STORE};
use crate::ledger::SourceHealth;

#[derive(Debug, Serialize)]
pub struct SourceHealthView {
    pub name: String,
    pub health: SourceHealth,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` when every source is healthy, `degraded` otherwise.
    pub status: &'static str,
    pub scheduler_running: bool,
    pub sources: Vec<SourceHealthView>,
}

pub async fn health(State(engine): State<ApiState>) -> impl IntoResponse {
    let mut sources = Vec::new();
    for name in engine.source_names().await {
        let health = engine.source_health(&name).await;
        sources.push(SourceHealthView { name, health });
    }

    let status = if sources.iter().all(|s| s.health == SourceHealth::Healthy) {
        "ok"
    } else {
        "degraded"
    };

    (
        [NO_STORE],
        Json(HealthResponse {
            status,
            scheduler_running: engine.is_running(),
            sources,
        }),
    )
}
