//! Read-through fetch facade.
//!
//! [`Manager::fetch`] answers from the cache when it can. On a miss it
//! resolves the source, waits for a rate-limit token, calls the adapter and
//! caches the result under the endpoint's TTL. Concurrent misses for the same
//! key are coalesced: only the first caller goes upstream, later ones reuse
//! what it wrote. The manager never retries; that belongs to the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, CacheStats, ReadThroughCache};
use crate::error::DataSourceError;
use crate::ledger::{MetricsLedger, PerformanceMetrics, RequestMetric};
use crate::limiter::LimiterError;
use crate::metrics::AppMetrics;
use crate::registry::{RegisteredSource, Registration, SourceRegistry};
use crate::source::{DataSource, Params, SourceConfig};

/// Outcome of a [`DataValidator`] check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Validation {
    pub passed: bool,
    /// Quality score in `0.0..=1.0`, recorded in the ledger either way.
    pub score: f64,
}

/// Optional payload check run on every upstream response before caching.
pub trait DataValidator: Send + Sync {
    fn validate(&self, source: &str, endpoint: &str, data: &Value) -> Validation;
}

pub struct Manager {
    registry: Arc<SourceRegistry>,
    cache: ReadThroughCache,
    ledger: Arc<MetricsLedger>,
    metrics: Arc<AppMetrics>,
    validator: Option<Arc<dyn DataValidator>>,
    max_rate_limit_wait: Option<Duration>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Manager {
    pub fn new(
        metrics: Arc<AppMetrics>,
        ledger_capacity: usize,
        max_rate_limit_wait: Option<Duration>,
    ) -> Self {
        Self {
            registry: Arc::new(SourceRegistry::new()),
            cache: ReadThroughCache::new().with_size_gauge(metrics.cache_entries.clone()),
            ledger: Arc::new(MetricsLedger::new(ledger_capacity)),
            metrics,
            validator: None,
            max_rate_limit_wait,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn DataValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Bind `name` to `adapter`, replacing any previous binding.
    pub async fn register_data_source(
        &self,
        name: &str,
        adapter: Arc<dyn DataSource>,
        config: SourceConfig,
    ) -> Result<Registration, DataSourceError> {
        config
            .validate()
            .map_err(|message| DataSourceError::invalid_config(name, message))?;

        let priority = config.priority;
        let frequency = config.update_frequency;
        let registration = self.registry.register(name, adapter, config).await;
        info!(
            source = name,
            priority = priority.as_str(),
            ?frequency,
            ?registration,
            "Data source registered"
        );
        Ok(registration)
    }

    pub async fn fetch(
        &self,
        source_name: &str,
        endpoint: &str,
        params: &Params,
        force_refresh: bool,
    ) -> Result<Value, DataSourceError> {
        let key = cache_key(source_name, endpoint, params);
        // Read before the lookup: any later write counts as concurrent.
        let observed = self.cache.generation();

        if !force_refresh {
            if let Some(value) = self.cache.get(&key).await {
                debug!(source = source_name, endpoint, "cache hit");
                self.record_cache_hit(source_name, endpoint).await;
                return Ok(value);
            }
        }

        let source = self
            .registry
            .get(source_name)
            .await
            .ok_or_else(|| DataSourceError::not_found(source_name, endpoint, params))?;

        let flight = self.join_flight(&key).await;
        let result = {
            let _guard = flight.lock().await;
            self.fetch_locked(&source, &key, endpoint, params, observed).await
        };
        self.leave_flight(&key, flight).await;
        result
    }

    /// [`fetch`](Self::fetch) and deserialize into `T`.
    pub async fn fetch_as<T: DeserializeOwned>(
        &self,
        source_name: &str,
        endpoint: &str,
        params: &Params,
        force_refresh: bool,
    ) -> Result<T, DataSourceError> {
        let value = self.fetch(source_name, endpoint, params, force_refresh).await?;
        serde_json::from_value(value).map_err(|err| {
            DataSourceError::decode(source_name, endpoint, params, err.to_string())
        })
    }

    async fn join_flight(&self, key: &str) -> Arc<Mutex<()>> {
        let mut in_flight = self.in_flight.lock().await;
        Arc::clone(
            in_flight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn leave_flight(&self, key: &str, flight: Arc<Mutex<()>>) {
        let mut in_flight = self.in_flight.lock().await;
        // One reference held by the map, one by us.
        if Arc::strong_count(&flight) <= 2 {
            in_flight.remove(key);
        }
    }

    async fn fetch_locked(
        &self,
        source: &RegisteredSource,
        key: &str,
        endpoint: &str,
        params: &Params,
        observed: u64,
    ) -> Result<Value, DataSourceError> {
        if let Some(entry) = self.cache.entry(key).await {
            if entry.generation > observed {
                debug!(source = %source.name, endpoint, "coalesced with concurrent fetch");
                self.record_cache_hit(&source.name, endpoint).await;
                return Ok(entry.value.clone());
            }
        }

        self.acquire_token(source, endpoint, params).await?;

        let started = Instant::now();
        let result = source.adapter.fetch(endpoint, params).await;
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        self.metrics
            .observe_fetch_duration(&source.name, elapsed.as_secs_f64());

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                let err = DataSourceError::from_source_error(&source.name, endpoint, params, &err);
                warn!(
                    source = %source.name,
                    endpoint,
                    status = ?err.status_code,
                    retryable = err.retryable,
                    "fetch failed: {}",
                    err.message
                );
                self.record_failure(&source.name, endpoint, duration_ms, &err, None)
                    .await;
                return Err(err);
            }
        };

        let score = match &self.validator {
            Some(validator) => {
                let validation = validator.validate(&source.name, endpoint, &value);
                if !validation.passed {
                    let err = DataSourceError::validation_failed(
                        &source.name,
                        endpoint,
                        params,
                        validation.score,
                    );
                    warn!(source = %source.name, endpoint, score = validation.score, "payload rejected");
                    self.record_failure(&source.name, endpoint, duration_ms, &err, Some(validation.score))
                        .await;
                    return Err(err);
                }
                Some(validation.score)
            }
            None => None,
        };

        self.cache
            .put_fetched(&source.name, endpoint, params, value.clone())
            .await;

        let mut metric = RequestMetric::fetch_success(endpoint, duration_ms);
        if let Some(score) = score {
            metric = metric.with_quality_score(score);
        }
        self.ledger.record(&source.name, metric).await;
        self.metrics.record_fetch(&source.name, "success");

        Ok(value)
    }

    async fn acquire_token(
        &self,
        source: &RegisteredSource,
        endpoint: &str,
        params: &Params,
    ) -> Result<(), DataSourceError> {
        let waited = match self.max_rate_limit_wait {
            None => source.limiter.acquire().await,
            Some(max_wait) => match source.limiter.acquire_within(max_wait).await {
                Ok(waited) => waited,
                Err(LimiterError::Timeout { waited_ms }) => {
                    let err = DataSourceError::rate_limit_timeout(
                        &source.name,
                        endpoint,
                        params,
                        waited_ms,
                    );
                    warn!(source = %source.name, endpoint, waited_ms, "gave up waiting for rate limit");
                    self.ledger
                        .record(
                            &source.name,
                            RequestMetric::rate_limited(endpoint, waited_ms as f64, &err),
                        )
                        .await;
                    self.metrics.record_fetch(&source.name, "rate_limited");
                    return Err(err);
                }
            },
        };

        if !waited.is_zero() {
            debug!(source = %source.name, waited_ms = waited.as_millis() as u64, "rate limited");
            self.metrics.record_rate_limit_wait(&source.name);
        }
        Ok(())
    }

    async fn record_cache_hit(&self, source_name: &str, endpoint: &str) {
        self.ledger
            .record(source_name, RequestMetric::cache_hit(endpoint))
            .await;
        self.metrics.record_fetch(source_name, "cache_hit");
    }

    async fn record_failure(
        &self,
        source_name: &str,
        endpoint: &str,
        duration_ms: f64,
        err: &DataSourceError,
        score: Option<f64>,
    ) {
        let mut metric = RequestMetric::fetch_failure(endpoint, duration_ms, err);
        if let Some(score) = score {
            metric = metric.with_quality_score(score);
        }
        self.ledger.record(source_name, metric).await;
        self.metrics.record_fetch(source_name, "error");
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &ReadThroughCache {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<MetricsLedger> {
        &self.ledger
    }

    pub fn metrics(&self) -> &Arc<AppMetrics> {
        &self.metrics
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn performance_metrics(&self, source_name: &str) -> PerformanceMetrics {
        self.ledger.performance(source_name).await
    }

    pub async fn in_flight_len(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schedule::{Priority, UpdateFrequency};
    use crate::services::mock_source::MockSource;
    use crate::source::{RateLimit, SourceError};
    use serde::Deserialize;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready, task};

    fn manager() -> Manager {
        Manager::new(Arc::new(AppMetrics::new().unwrap()), 100, None)
    }

    fn config(requests: u32, window_seconds: f64) -> SourceConfig {
        SourceConfig::new(
            RateLimit::new(requests, window_seconds),
            UpdateFrequency::Daily,
            Priority::Medium,
        )
    }

    fn params(series: &str) -> Params {
        let mut params = Params::new();
        params.insert("series".into(), series.into());
        params
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_skips_adapter_and_limiter() {
        let manager = manager();
        let adapter = Arc::new(MockSource::new("boc"));
        manager
            .register_data_source("boc", adapter.clone(), config(1, 3600.0))
            .await
            .unwrap();

        let first = manager.fetch("boc", "rates", &params("USD"), false).await.unwrap();
        let second = manager.fetch("boc", "rates", &params("USD"), false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(adapter.fetch_count(), 1);
        // The only token went to the first call; a second upstream call would block.
        let source = manager.registry().get("boc").await.unwrap();
        assert!(source.limiter.available_tokens().await < 1.0);

        let perf = manager.performance_metrics("boc").await;
        assert_eq!(perf.cache_hits, 1);
        assert_eq!(perf.upstream_calls, 1);
        assert_eq!(manager.metrics().cache_entries.get(), 1.0);
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let manager = manager();
        let err = manager.fetch("ghost", "rates", &Params::new(), false).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(!err.retryable);
        assert_eq!(err.source_name, "ghost");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let manager = manager();
        let err = manager
            .register_data_source("boc", Arc::new(MockSource::new("boc")), config(0, 60.0))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidConfig);
        assert!(manager.registry().is_empty().await);
    }

    #[tokio::test]
    async fn upstream_errors_are_normalized_and_not_cached() {
        let manager = manager();
        let adapter = Arc::new(MockSource::new("boc"));
        adapter
            .queue_result(Err(SourceError::Http {
                status: 503,
                message: "maintenance".into(),
            }))
            .await;
        adapter
            .queue_result(Err(SourceError::Http {
                status: 404,
                message: "no such series".into(),
            }))
            .await;
        manager
            .register_data_source("boc", adapter.clone(), config(10, 1.0))
            .await
            .unwrap();

        let transient = manager.fetch("boc", "rates", &Params::new(), false).await.unwrap_err();
        assert_eq!(transient.kind, ErrorKind::TransientUpstream);
        assert!(transient.retryable);
        assert_eq!(transient.status_code, Some(503));
        assert_eq!(transient.endpoint, "rates");

        let permanent = manager.fetch("boc", "rates", &Params::new(), false).await.unwrap_err();
        assert_eq!(permanent.kind, ErrorKind::PermanentUpstream);
        assert!(!permanent.retryable);

        assert!(manager.cache().is_empty().await);
        let perf = manager.performance_metrics("boc").await;
        assert_eq!(perf.failed_calls, 2);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_cache() {
        let manager = manager();
        let adapter = Arc::new(MockSource::new("boc"));
        manager
            .register_data_source("boc", adapter.clone(), config(10, 1.0))
            .await
            .unwrap();

        manager.fetch("boc", "rates", &Params::new(), false).await.unwrap();
        manager.fetch("boc", "rates", &Params::new(), true).await.unwrap();
        assert_eq!(adapter.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_upstream_call() {
        let manager = manager();
        let adapter = Arc::new(MockSource::new("boc").with_delay(Duration::from_millis(200)));
        manager
            .register_data_source("boc", adapter.clone(), config(10, 1.0))
            .await
            .unwrap();

        let p = params("USD");
        let (a, b, c) = tokio::join!(
            manager.fetch("boc", "rates", &p, false),
            manager.fetch("boc", "rates", &p, false),
            manager.fetch("boc", "rates", &p, false),
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert!(c.is_ok());
        assert_eq!(adapter.fetch_count(), 1);
        assert_eq!(manager.in_flight_len().await, 0);
        assert_eq!(manager.performance_metrics("boc").await.cache_hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn write_landing_before_the_flight_is_reused() {
        let manager = manager();
        let adapter = Arc::new(MockSource::new("boc"));
        manager
            .register_data_source("boc", adapter.clone(), config(10, 1.0))
            .await
            .unwrap();

        let p = params("USD");
        let in_flight = manager.in_flight.lock().await;
        let mut late = task::spawn(manager.fetch("boc", "rates", &p, false));
        assert_pending!(late.poll());

        // Another caller's fetch of the same key completes in the meantime.
        manager
            .cache()
            .put_fetched("boc", "rates", &p, json!({"from": "other"}))
            .await;
        drop(in_flight);

        let value = assert_ready!(late.poll()).unwrap();
        assert_eq!(value, json!({"from": "other"}));
        assert_eq!(adapter.fetch_count(), 0);
        assert_eq!(manager.performance_metrics("boc").await.cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_turns_into_rate_limit_error() {
        let manager = Manager::new(
            Arc::new(AppMetrics::new().unwrap()),
            100,
            Some(Duration::from_millis(500)),
        );
        let adapter = Arc::new(MockSource::new("boc"));
        manager
            .register_data_source("boc", adapter.clone(), config(1, 10.0))
            .await
            .unwrap();

        manager.fetch("boc", "rates", &params("USD"), false).await.unwrap();
        let err = manager
            .fetch("boc", "rates", &params("EUR"), false)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimitTimeout);
        assert_eq!(err.status_code, Some(429));
        assert!(err.retryable);
        assert_eq!(adapter.fetch_count(), 1);

        let perf = manager.performance_metrics("boc").await;
        assert_eq!(perf.upstream_calls, 1);
        assert_eq!(perf.failed_calls, 0);
        assert_eq!(perf.rate_limit_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn near_zero_refill_rate_times_out_cleanly() {
        let manager = Manager::new(
            Arc::new(AppMetrics::new().unwrap()),
            100,
            Some(Duration::from_millis(500)),
        );
        let adapter = Arc::new(MockSource::new("boc"));
        manager
            .register_data_source("boc", adapter.clone(), config(1, 1e20))
            .await
            .unwrap();

        manager.fetch("boc", "rates", &params("USD"), false).await.unwrap();
        let err = manager
            .fetch("boc", "rates", &params("EUR"), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimitTimeout);
        assert_eq!(adapter.fetch_count(), 1);
    }

    struct RequireObservations;

    impl DataValidator for RequireObservations {
        fn validate(&self, _source: &str, _endpoint: &str, data: &Value) -> Validation {
            if data.get("observations").is_some() {
                Validation { passed: true, score: 0.9 }
            } else {
                Validation { passed: false, score: 0.1 }
            }
        }
    }

    #[tokio::test]
    async fn rejected_payloads_are_not_cached() {
        let manager = manager().with_validator(Arc::new(RequireObservations));
        let adapter = Arc::new(MockSource::new("boc"));
        adapter.queue_result(Ok(json!({"observations": []}))).await;
        manager
            .register_data_source("boc", adapter.clone(), config(10, 1.0))
            .await
            .unwrap();

        manager.fetch("boc", "good", &Params::new(), false).await.unwrap();
        let err = manager.fetch("boc", "bad", &Params::new(), false).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ValidationFailed);
        assert!(!err.retryable);
        assert_eq!(manager.cache().len().await, 1);

        let perf = manager.performance_metrics("boc").await;
        let score = perf.average_quality_score.unwrap();
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Rate {
        series: String,
        value: f64,
    }

    #[tokio::test]
    async fn fetch_as_deserializes_or_reports_shape_mismatch() {
        let manager = manager();
        let adapter = Arc::new(MockSource::new("boc"));
        adapter
            .queue_result(Ok(json!({"series": "FXUSDCAD", "value": 1.36})))
            .await;
        manager
            .register_data_source("boc", adapter, config(10, 1.0))
            .await
            .unwrap();

        let rate: Rate = manager
            .fetch_as("boc", "rates", &Params::new(), false)
            .await
            .unwrap();
        assert_eq!(rate.series, "FXUSDCAD");

        let err = manager
            .fetch_as::<Rate>("boc", "other", &Params::new(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermanentUpstream);
    }
}
