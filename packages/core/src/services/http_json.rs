use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tokio::time::Instant;

use crate::config::SourceDefinition;
use crate::error::AppError;
use crate::source::{DataSource, HealthReport, Params, SourceError, SourceResult};

/// Health probes slower than this are reported as degraded.
pub const SLOW_HEALTH_THRESHOLD: Duration = Duration::from_secs(2);

/// Generic adapter for providers that answer `GET {base_url}/{endpoint}?{params}`
/// with a JSON document.
#[derive(Clone, Debug)]
pub struct HttpJsonSource {
    name: String,
    base_url: String,
    health_path: String,
    http: Client,
}

impl HttpJsonSource {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        health_path: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Network(err.to_string()))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            health_path: health_path.into(),
            http,
        })
    }

    pub fn from_definition(definition: &SourceDefinition) -> Result<Self, AppError> {
        Self::new(
            definition.name.clone(),
            definition.base_url.clone(),
            definition.health_path.clone(),
            Duration::from_millis(definition.timeout_ms),
        )
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

fn transport_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Network {
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl DataSource for HttpJsonSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let result = self.http.get(self.url_for(&self.health_path)).send().await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        match result {
            Ok(response) if response.status().is_success() => {
                if elapsed > SLOW_HEALTH_THRESHOLD {
                    HealthReport::degraded(elapsed_ms, format!("slow response: {}ms", elapsed_ms))
                } else {
                    HealthReport::healthy(elapsed_ms)
                }
            }
            Ok(response) => {
                HealthReport::unhealthy(elapsed_ms, format!("HTTP {}", response.status().as_u16()))
            }
            Err(err) => HealthReport::unhealthy(elapsed_ms, transport_error(err).to_string()),
        }
    }

    async fn fetch(&self, endpoint: &str, params: &Params) -> SourceResult<Value> {
        let url = self.url_for(endpoint);
        tracing::debug!(source = %self.name, %url, "fetching");

        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Http {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unexpected status")
                    .to_string(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| SourceError::Format {
                message: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_without_double_slashes() {
        let source =
            HttpJsonSource::new("boc", "https://example.org/api/", "/health", Duration::from_secs(1))
                .unwrap();
        assert_eq!(source.base_url(), "https://example.org/api");
        assert_eq!(source.url_for("/rates/daily"), "https://example.org/api/rates/daily");
        assert_eq!(source.url_for("health"), "https://example.org/api/health");
    }
}
