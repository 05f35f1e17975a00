use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};

use super::ApiState;
use crate::error::AppError;

/// Prometheus text exposition of [`AppMetrics`](crate::metrics::AppMetrics).
pub async fn prometheus_metrics(State(engine): State<ApiState>) -> Result<Response, AppError> {
    let body = engine.metrics().render()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}
