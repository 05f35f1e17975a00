//! Cache, schedule and ledger views, plus manual sync triggers.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use super::{ApiState, NO_STORE};
use crate::error::{AppError, DataSourceError};
use crate::source::Params;

pub async fn cache_stats(State(engine): State<ApiState>) -> impl IntoResponse {
    ([NO_STORE], Json(engine.cache_stats().await))
}

pub async fn sync_status(State(engine): State<ApiState>) -> impl IntoResponse {
    ([NO_STORE], Json(engine.sync_status().await))
}

pub async fn summary(State(engine): State<ApiState>) -> impl IntoResponse {
    ([NO_STORE], Json(engine.summary().await))
}

#[derive(Debug, Serialize)]
pub struct SourceMetricsResponse {
    #[serde(flatten)]
    pub performance: crate::ledger::PerformanceMetrics,
    pub health: crate::ledger::SourceHealth,
}

pub async fn source_metrics(
    State(engine): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if !engine.is_registered(&name).await {
        return Err(DataSourceError::not_found(&name, "metrics", &Params::new()).into());
    }
    let body = SourceMetricsResponse {
        performance: engine.performance_metrics(&name).await,
        health: engine.source_health(&name).await,
    };
    Ok(([NO_STORE], Json(body)))
}

pub async fn force_sync(
    State(engine): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let report = engine.force_sync(&name).await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct ForceSyncAllResponse {
    pub synced: usize,
    pub failed: usize,
    pub reports: Vec<crate::scheduler::SyncReport>,
}

pub async fn force_sync_all(State(engine): State<ApiState>) -> impl IntoResponse {
    let reports = engine.force_sync_all().await;
    let synced = reports.iter().filter(|r| r.outcome.is_success()).count();
    Json(ForceSyncAllResponse {
        synced,
        failed: reports.len() - synced,
        reports,
    })
}
