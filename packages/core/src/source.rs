//! Data source capability contract.
//!
//! Every upstream provider (statistics bureau, central bank, open-data
//! portal) is wrapped in an adapter implementing [`DataSource`]. The engine
//! never builds provider requests itself; it only calls `fetch` and
//! `health_check` through this trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::schedule::{Priority, RetryPolicy, UpdateFrequency};

/// Request parameters. Ordered, so identical parameter sets hash identically.
pub type Params = BTreeMap<String, String>;

/// Coarse health classification reported by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Result of a single adapter health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub response_time_ms: u64,
    pub errors: Vec<String>,
}

impl HealthReport {
    pub fn healthy(response_time_ms: u64) -> Self {
        Self {
            status: HealthState::Healthy,
            response_time_ms,
            errors: Vec::new(),
        }
    }

    pub fn degraded(response_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status: HealthState::Degraded,
            response_time_ms,
            errors: vec![error.into()],
        }
    }

    pub fn unhealthy(response_time_ms: u64, error: impl Into<String>) -> Self {
        Self {
            status: HealthState::Unhealthy,
            response_time_ms,
            errors: vec![error.into()],
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

/// Errors raised by adapters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Data format error: {message}")]
    Format { message: String },

    #[error("Service unavailable: {message}")]
    Unavailable { message: String },
}

impl SourceError {
    /// Upstream status code, if the failure has one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Timeout => Some(408),
            Self::Unavailable { .. } => Some(503),
            Self::Network { .. } | Self::Format { .. } => None,
        }
    }
}

/// Result type for adapter operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Capability every provider adapter must satisfy.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Name of this provider for logging/debugging
    fn name(&self) -> &str;

    /// Probe the provider. Never fails; problems are reported in the result.
    async fn health_check(&self) -> HealthReport;

    /// Fetch raw data for `endpoint` with `params`.
    async fn fetch(&self, endpoint: &str, params: &Params) -> SourceResult<Value>;
}

/// Per-source admission budget: `requests` per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests: u32,
    pub window_seconds: f64,
}

impl RateLimit {
    pub fn new(requests: u32, window_seconds: f64) -> Self {
        Self {
            requests,
            window_seconds,
        }
    }

    /// Continuous refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.requests) / self.window_seconds
    }
}

/// An endpoint/params pair re-fetched by every background refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub endpoint: String,
    #[serde(default)]
    pub params: Params,
}

impl SyncTarget {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

fn default_retry_on_failure() -> bool {
    true
}

/// Registration settings for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub rate_limit: RateLimit,
    pub update_frequency: UpdateFrequency,
    pub priority: Priority,
    #[serde(default = "default_retry_on_failure")]
    pub retry_on_failure: bool,
    #[serde(default)]
    pub retry_config: RetryPolicy,
    #[serde(default)]
    pub sync_targets: Vec<SyncTarget>,
}

impl SourceConfig {
    pub fn new(rate_limit: RateLimit, update_frequency: UpdateFrequency, priority: Priority) -> Self {
        Self {
            rate_limit,
            update_frequency,
            priority,
            retry_on_failure: true,
            retry_config: RetryPolicy::default(),
            sync_targets: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry_config: RetryPolicy) -> Self {
        self.retry_on_failure = true;
        self.retry_config = retry_config;
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry_on_failure = false;
        self
    }

    pub fn with_sync_target(mut self, target: SyncTarget) -> Self {
        self.sync_targets.push(target);
        self
    }

    /// Reject settings the limiter or backoff cannot work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.rate_limit.requests == 0 {
            return Err("rate_limit.requests must be at least 1".to_string());
        }
        if !(self.rate_limit.window_seconds > 0.0) || !self.rate_limit.window_seconds.is_finite() {
            return Err("rate_limit.window_seconds must be a positive number".to_string());
        }
        if self.retry_on_failure {
            if self.retry_config.initial_delay_ms == 0 {
                return Err("retry_config.initial_delay_ms must be positive".to_string());
            }
            if !(self.retry_config.backoff_multiplier >= 1.0) {
                return Err("retry_config.backoff_multiplier must be >= 1".to_string());
            }
        }
        for target in &self.sync_targets {
            if target.endpoint.trim().is_empty() {
                return Err("sync target endpoint must not be empty".to_string());
            }
        }
        Ok(())
    }
}
