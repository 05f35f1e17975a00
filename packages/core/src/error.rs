use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::source::{HealthReport, Params, SourceError};

/// Upstream status codes that mark a failure as transient.
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// Failure classes a caller can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The source name was never registered.
    NotFound,
    /// HTTP 408/429/5xx from upstream.
    TransientUpstream,
    /// Any other upstream failure, including malformed payloads.
    PermanentUpstream,
    /// The connection failed before upstream answered.
    Transport,
    /// The adapter's health check did not report healthy.
    Unhealthy,
    /// No rate-limit token arrived within the configured wait bound.
    RateLimitTimeout,
    /// The payload was fetched but rejected by the validator.
    ValidationFailed,
    /// Registration was attempted with an unusable config.
    InvalidConfig,
}

/// Normalized error shape returned for every failure path of the engine.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{source_name} {endpoint}: {message}")]
pub struct DataSourceError {
    pub kind: ErrorKind,
    pub source_name: String,
    pub endpoint: String,
    pub message: String,
    pub status_code: Option<u16>,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    pub params: Params,
}

impl DataSourceError {
    fn build(
        kind: ErrorKind,
        source_name: &str,
        endpoint: &str,
        params: &Params,
        message: impl Into<String>,
        status_code: Option<u16>,
        retryable: bool,
    ) -> Self {
        Self {
            kind,
            source_name: source_name.to_string(),
            endpoint: endpoint.to_string(),
            message: message.into(),
            status_code,
            retryable,
            timestamp: Utc::now(),
            params: params.clone(),
        }
    }

    pub fn not_found(source_name: &str, endpoint: &str, params: &Params) -> Self {
        Self::build(
            ErrorKind::NotFound,
            source_name,
            endpoint,
            params,
            format!("data source '{}' not found", source_name),
            None,
            false,
        )
    }

    /// Wrap an adapter failure. Retryable iff the upstream status is transient.
    pub fn from_source_error(
        source_name: &str,
        endpoint: &str,
        params: &Params,
        error: &SourceError,
    ) -> Self {
        let status_code = error.status_code();
        let retryable = status_code.map(is_retryable_status).unwrap_or(false);
        let kind = match error {
            SourceError::Network { .. } => ErrorKind::Transport,
            _ if retryable => ErrorKind::TransientUpstream,
            _ => ErrorKind::PermanentUpstream,
        };
        Self::build(
            kind,
            source_name,
            endpoint,
            params,
            error.to_string(),
            status_code,
            retryable,
        )
    }

    /// A failed health probe during a sync. Subject to the retry policy.
    pub fn unhealthy(source_name: &str, report: &HealthReport) -> Self {
        let detail = if report.errors.is_empty() {
            String::new()
        } else {
            format!(" ({})", report.errors.join("; "))
        };
        Self::build(
            ErrorKind::Unhealthy,
            source_name,
            "healthCheck",
            &Params::new(),
            format!("source reported {}{}", report.status.as_str(), detail),
            None,
            true,
        )
    }

    /// Whether another attempt can never succeed without a change upstream
    /// or in configuration. Background syncs retry everything else.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NotFound
                | ErrorKind::PermanentUpstream
                | ErrorKind::ValidationFailed
                | ErrorKind::InvalidConfig
        )
    }

    pub fn rate_limit_timeout(
        source_name: &str,
        endpoint: &str,
        params: &Params,
        waited_ms: u64,
    ) -> Self {
        Self::build(
            ErrorKind::RateLimitTimeout,
            source_name,
            endpoint,
            params,
            format!("no rate-limit token available after {}ms", waited_ms),
            Some(429),
            true,
        )
    }

    pub fn validation_failed(
        source_name: &str,
        endpoint: &str,
        params: &Params,
        score: f64,
    ) -> Self {
        Self::build(
            ErrorKind::ValidationFailed,
            source_name,
            endpoint,
            params,
            format!("payload rejected by validator (score {:.2})", score),
            None,
            false,
        )
    }

    pub fn decode(source_name: &str, endpoint: &str, params: &Params, message: String) -> Self {
        Self::build(
            ErrorKind::PermanentUpstream,
            source_name,
            endpoint,
            params,
            format!("unexpected payload shape: {}", message),
            None,
            false,
        )
    }

    pub fn invalid_config(source_name: &str, message: impl Into<String>) -> Self {
        Self::build(
            ErrorKind::InvalidConfig,
            source_name,
            "",
            &Params::new(),
            message,
            None,
            false,
        )
    }
}

/// Process-level application error.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    DataSource(#[from] DataSourceError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Parse(_) => StatusCode::BAD_REQUEST,
            AppError::Network(_) => StatusCode::BAD_GATEWAY,
            AppError::Metrics(_) | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::DataSource(err) => match err.kind {
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::InvalidConfig => StatusCode::BAD_REQUEST,
                ErrorKind::RateLimitTimeout => StatusCode::TOO_MANY_REQUESTS,
                _ if err.retryable => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::DataSource(err) => json!({ "error": err.message, "details": err }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_are_retryable() {
        for status in [408, 429, 500, 502, 503, 504] {
            let err = DataSourceError::from_source_error(
                "boc",
                "rates/daily",
                &Params::new(),
                &SourceError::Http {
                    status,
                    message: "upstream".into(),
                },
            );
            assert!(err.retryable, "status {} should be retryable", status);
            assert_eq!(err.kind, ErrorKind::TransientUpstream);
            assert_eq!(err.status_code, Some(status));
        }
    }

    #[test]
    fn other_client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 422] {
            let err = DataSourceError::from_source_error(
                "boc",
                "rates/daily",
                &Params::new(),
                &SourceError::Http {
                    status,
                    message: "nope".into(),
                },
            );
            assert!(!err.retryable);
            assert_eq!(err.kind, ErrorKind::PermanentUpstream);
        }
    }

    #[test]
    fn malformed_payload_is_permanent() {
        let err = DataSourceError::from_source_error(
            "statcan",
            "tables",
            &Params::new(),
            &SourceError::Format {
                message: "expected array".into(),
            },
        );
        assert!(!err.retryable);
        assert_eq!(err.status_code, None);
    }

    #[test]
    fn connection_failure_is_transport_not_permanent() {
        let err = DataSourceError::from_source_error(
            "boc",
            "rates/daily",
            &Params::new(),
            &SourceError::Network {
                message: "connection reset".into(),
            },
        );
        assert_eq!(err.kind, ErrorKind::Transport);
        assert_eq!(err.status_code, None);
        assert!(!err.retryable);
        assert!(!err.is_permanent());
    }

    #[test]
    fn adapter_timeout_maps_to_408() {
        let err = DataSourceError::from_source_error(
            "statcan",
            "tables",
            &Params::new(),
            &SourceError::Timeout,
        );
        assert_eq!(err.status_code, Some(408));
        assert!(err.retryable);
    }

    #[test]
    fn not_found_carries_request_context() {
        let mut params = Params::new();
        params.insert("series".into(), "FXUSDCAD".into());
        let err = DataSourceError::not_found("missing", "rates", &params);

        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("not found"));
        assert_eq!(err.params.get("series").map(String::as_str), Some("FXUSDCAD"));
        assert!(!err.retryable);
    }

    #[test]
    fn app_error_status_follows_kind() {
        let not_found = AppError::from(DataSourceError::not_found("x", "y", &Params::new()));
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let limited = AppError::from(DataSourceError::rate_limit_timeout(
            "x",
            "y",
            &Params::new(),
            50,
        ));
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
