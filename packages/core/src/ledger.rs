//! Per-source request ledger.
//!
//! Cumulative counters are never reset. Alongside them each source keeps a
//! bounded window of recent [`RequestMetric`]s (oldest evicted first) used for
//! latency percentiles and health classification.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::DataSourceError;

/// Default number of recent metrics retained per source.
pub const DEFAULT_CAPACITY: usize = 1_000;

/// Entries considered when classifying health.
const HEALTH_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Fetch,
    CacheHit,
    /// Gave up waiting for a token; upstream was never called.
    RateLimited,
    Sync,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetric {
    pub kind: MetricKind,
    pub endpoint: String,
    pub duration_ms: f64,
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub quality_score: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl RequestMetric {
    fn new(kind: MetricKind, endpoint: &str, duration_ms: f64, success: bool) -> Self {
        Self {
            kind,
            endpoint: endpoint.to_string(),
            duration_ms,
            success,
            status_code: None,
            error: None,
            quality_score: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn fetch_success(endpoint: &str, duration_ms: f64) -> Self {
        Self::new(MetricKind::Fetch, endpoint, duration_ms, true)
    }

    pub fn fetch_failure(endpoint: &str, duration_ms: f64, error: &DataSourceError) -> Self {
        Self {
            status_code: error.status_code,
            error: Some(error.message.clone()),
            ..Self::new(MetricKind::Fetch, endpoint, duration_ms, false)
        }
    }

    pub fn rate_limited(endpoint: &str, waited_ms: f64, error: &DataSourceError) -> Self {
        Self {
            status_code: error.status_code,
            error: Some(error.message.clone()),
            ..Self::new(MetricKind::RateLimited, endpoint, waited_ms, false)
        }
    }

    pub fn cache_hit(endpoint: &str) -> Self {
        Self::new(MetricKind::CacheHit, endpoint, 0.0, true)
    }

    pub fn sync(duration_ms: f64, error: Option<&DataSourceError>) -> Self {
        match error {
            None => Self::new(MetricKind::Sync, "sync", duration_ms, true),
            Some(err) => Self {
                status_code: err.status_code,
                error: Some(err.message.clone()),
                ..Self::new(MetricKind::Sync, "sync", duration_ms, false)
            },
        }
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Default)]
struct Counters {
    upstream_successes: u64,
    upstream_failures: u64,
    cache_hits: u64,
    rate_limit_timeouts: u64,
    sync_successes: u64,
    sync_failures: u64,
    upstream_latency_ms: f64,
    quality_sum: f64,
    quality_samples: u64,
    last_error: Option<String>,
    last_recorded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SourceLedger {
    counters: Counters,
    recent: VecDeque<RequestMetric>,
}

impl SourceLedger {
    fn push(&mut self, metric: RequestMetric, capacity: usize) {
        let c = &mut self.counters;
        match (metric.kind, metric.success) {
            (MetricKind::Fetch, true) => c.upstream_successes += 1,
            (MetricKind::Fetch, false) => c.upstream_failures += 1,
            (MetricKind::CacheHit, _) => c.cache_hits += 1,
            (MetricKind::RateLimited, _) => c.rate_limit_timeouts += 1,
            (MetricKind::Sync, true) => c.sync_successes += 1,
            (MetricKind::Sync, false) => c.sync_failures += 1,
        }
        if metric.kind == MetricKind::Fetch {
            c.upstream_latency_ms += metric.duration_ms;
        }
        if let Some(score) = metric.quality_score {
            c.quality_sum += score;
            c.quality_samples += 1;
        }
        if metric.error.is_some() {
            c.last_error = metric.error.clone();
        }
        c.last_recorded_at = Some(metric.recorded_at);

        if self.recent.len() >= capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(metric);
    }

    fn health(&self) -> SourceHealth {
        let judged: Vec<&RequestMetric> = self
            .recent
            .iter()
            .rev()
            .filter(|m| matches!(m.kind, MetricKind::Fetch | MetricKind::Sync))
            .take(HEALTH_WINDOW)
            .collect();
        if judged.is_empty() {
            return SourceHealth::Healthy;
        }
        let failures = judged.iter().filter(|m| !m.success).count();
        let error_rate = failures as f64 / judged.len() as f64;
        if error_rate < 0.10 {
            SourceHealth::Healthy
        } else if error_rate < 0.50 {
            SourceHealth::Degraded
        } else {
            SourceHealth::Unhealthy
        }
    }

    fn p95_latency_ms(&self) -> f64 {
        let mut samples: Vec<f64> = self
            .recent
            .iter()
            .filter(|m| m.kind == MetricKind::Fetch)
            .map(|m| m.duration_ms)
            .collect();
        if samples.is_empty() {
            return 0.0;
        }
        samples.sort_by(|a, b| a.total_cmp(b));
        let rank = ((samples.len() as f64) * 0.95).ceil() as usize;
        samples[rank.clamp(1, samples.len()) - 1]
    }
}

/// Aggregated view of a source's ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub source: String,
    pub total_requests: u64,
    pub upstream_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub success_rate: f64,
    /// Fetches refused locally by the rate-limit wait bound. Not part of
    /// `total_requests`.
    pub rate_limit_timeouts: u64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub sync_attempts: u64,
    pub sync_failures: u64,
    pub average_quality_score: Option<f64>,
    pub last_error: Option<String>,
    pub last_recorded_at: Option<DateTime<Utc>>,
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl PerformanceMetrics {
    fn from_ledger(source: &str, ledger: &SourceLedger) -> Self {
        let c = &ledger.counters;
        let upstream_calls = c.upstream_successes + c.upstream_failures;
        let total_requests = upstream_calls + c.cache_hits;
        Self {
            source: source.to_string(),
            total_requests,
            upstream_calls,
            successful_calls: c.upstream_successes,
            failed_calls: c.upstream_failures,
            cache_hits: c.cache_hits,
            cache_hit_rate: ratio(c.cache_hits, total_requests),
            success_rate: ratio(c.upstream_successes, upstream_calls),
            rate_limit_timeouts: c.rate_limit_timeouts,
            average_latency_ms: if upstream_calls == 0 {
                0.0
            } else {
                c.upstream_latency_ms / upstream_calls as f64
            },
            p95_latency_ms: ledger.p95_latency_ms(),
            sync_attempts: c.sync_successes + c.sync_failures,
            sync_failures: c.sync_failures,
            average_quality_score: (c.quality_samples > 0)
                .then(|| c.quality_sum / c.quality_samples as f64),
            last_error: c.last_error.clone(),
            last_recorded_at: c.last_recorded_at,
        }
    }
}

/// One row of [`LedgerSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSummary {
    pub source: String,
    pub health: SourceHealth,
    pub total_requests: u64,
    pub success_rate: f64,
    pub cache_hit_rate: f64,
    pub average_latency_ms: f64,
}

/// Roll-up of recorded metrics across all sources. Derived only from the
/// ledger; contains no projections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub generated_at: DateTime<Utc>,
    pub sources: Vec<SourceSummary>,
    pub total_requests: u64,
    pub overall_success_rate: f64,
    pub overall_cache_hit_rate: f64,
}

#[derive(Debug)]
pub struct MetricsLedger {
    capacity: usize,
    sources: RwLock<HashMap<String, SourceLedger>>,
}

impl Default for MetricsLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MetricsLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sources: RwLock::new(HashMap::new()),
        }
    }

    pub async fn record(&self, source: &str, metric: RequestMetric) {
        let mut sources = self.sources.write().await;
        sources
            .entry(source.to_string())
            .or_default()
            .push(metric, self.capacity);
    }

    /// Aggregates for `source`; all zeros when nothing was recorded.
    pub async fn performance(&self, source: &str) -> PerformanceMetrics {
        let sources = self.sources.read().await;
        match sources.get(source) {
            Some(ledger) => PerformanceMetrics::from_ledger(source, ledger),
            None => PerformanceMetrics {
                source: source.to_string(),
                ..PerformanceMetrics::default()
            },
        }
    }

    /// The `n` most recent metrics for `source`, oldest first.
    pub async fn recent(&self, source: &str, n: usize) -> Vec<RequestMetric> {
        let sources = self.sources.read().await;
        sources
            .get(source)
            .map(|ledger| {
                let skip = ledger.recent.len().saturating_sub(n);
                ledger.recent.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub async fn health(&self, source: &str) -> SourceHealth {
        let sources = self.sources.read().await;
        sources
            .get(source)
            .map(SourceLedger::health)
            .unwrap_or(SourceHealth::Healthy)
    }

    pub async fn summary(&self) -> LedgerSummary {
        let sources = self.sources.read().await;
        let mut rows: Vec<SourceSummary> = sources
            .iter()
            .map(|(name, ledger)| {
                let perf = PerformanceMetrics::from_ledger(name, ledger);
                SourceSummary {
                    source: name.clone(),
                    health: ledger.health(),
                    total_requests: perf.total_requests,
                    success_rate: perf.success_rate,
                    cache_hit_rate: perf.cache_hit_rate,
                    average_latency_ms: perf.average_latency_ms,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.source.cmp(&b.source));

        let (mut upstream, mut successes, mut hits) = (0u64, 0u64, 0u64);
        for ledger in sources.values() {
            let c = &ledger.counters;
            upstream += c.upstream_successes + c.upstream_failures;
            successes += c.upstream_successes;
            hits += c.cache_hits;
        }

        LedgerSummary {
            generated_at: Utc::now(),
            sources: rows,
            total_requests: upstream + hits,
            overall_success_rate: ratio(successes, upstream),
            overall_cache_hit_rate: ratio(hits, upstream + hits),
        }
    }
}
