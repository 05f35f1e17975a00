//! In-memory [`DataSource`] for tests and local runs without network access.
//!
//! Scripted results queued with [`MockSource::queue_result`] are served first,
//! in order. After that every fetch returns the configured error, if any, or
//! the configured response. Every call is logged for inspection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::source::{DataSource, HealthReport, Params, SourceError, SourceResult};

#[derive(Debug, Clone)]
pub struct FetchCall {
    pub endpoint: String,
    pub params: Params,
    pub at: Instant,
}

#[derive(Debug)]
pub struct MockSource {
    name: String,
    response: Option<Value>,
    delay: Option<Duration>,
    error: Mutex<Option<SourceError>>,
    health: Mutex<HealthReport>,
    queued: Mutex<VecDeque<SourceResult<Value>>>,
    calls: Mutex<Vec<FetchCall>>,
    fetches: AtomicUsize,
    health_checks: AtomicUsize,
}

impl MockSource {
    /// A healthy source that echoes the request back as its payload.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            response: None,
            delay: None,
            error: Mutex::new(None),
            health: Mutex::new(HealthReport::healthy(1)),
            queued: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
        }
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_error(mut self, error: SourceError) -> Self {
        self.error = Mutex::new(Some(error));
        self
    }

    pub fn with_health(mut self, report: HealthReport) -> Self {
        self.health = Mutex::new(report);
        self
    }

    /// Every fetch sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn set_health(&self, report: HealthReport) {
        *self.health.lock().await = report;
    }

    /// Replace (or clear) the error returned once the queue is drained.
    pub async fn set_error(&self, error: Option<SourceError>) {
        *self.error.lock().await = error;
    }

    pub async fn queue_result(&self, result: SourceResult<Value>) {
        self.queued.lock().await.push_back(result);
    }

    pub async fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().await.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn health_check_count(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }

    fn echo(&self, endpoint: &str, params: &Params) -> Value {
        json!({
            "source": self.name,
            "endpoint": endpoint,
            "params": params,
        })
    }
}

#[async_trait]
impl DataSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> HealthReport {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.health.lock().await.clone()
    }

    async fn fetch(&self, endpoint: &str, params: &Params) -> SourceResult<Value> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().await.push(FetchCall {
            endpoint: endpoint.to_string(),
            params: params.clone(),
            at: Instant::now(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(result) = self.queued.lock().await.pop_front() {
            return result;
        }
        if let Some(error) = self.error.lock().await.clone() {
            return Err(error);
        }
        Ok(self
            .response
            .clone()
            .unwrap_or_else(|| self.echo(endpoint, params)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::HealthState;

    #[tokio::test]
    async fn echoes_request_by_default() {
        let source = MockSource::new("boc");
        let mut params = Params::new();
        params.insert("series".into(), "FXUSDCAD".into());

        let value = source.fetch("rates", &params).await.unwrap();
        assert_eq!(value["source"], "boc");
        assert_eq!(value["endpoint"], "rates");
        assert_eq!(value["params"]["series"], "FXUSDCAD");
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn queued_results_are_served_before_the_default() {
        let source = MockSource::new("boc").with_response(json!({"ok": true}));
        source.queue_result(Err(SourceError::Timeout)).await;

        assert_eq!(source.fetch("x", &Params::new()).await, Err(SourceError::Timeout));
        assert_eq!(source.fetch("x", &Params::new()).await.unwrap(), json!({"ok": true}));
    }

    #[tokio::test]
    async fn error_can_be_cleared_at_runtime() {
        let source = MockSource::new("boc").with_error(SourceError::Unavailable {
            message: "maintenance".into(),
        });
        assert!(source.fetch("x", &Params::new()).await.is_err());

        source.set_error(None).await;
        assert!(source.fetch("x", &Params::new()).await.is_ok());
        assert_eq!(source.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn health_is_scriptable() {
        let source = MockSource::new("boc");
        assert!(source.health_check().await.is_healthy());

        source.set_health(HealthReport::unhealthy(0, "down")).await;
        assert_eq!(source.health_check().await.status, HealthState::Unhealthy);
        assert_eq!(source.health_check_count(), 2);
    }
}
