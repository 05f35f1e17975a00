//! Prometheus metrics for the refresh engine.
//!
//! [`AppMetrics`] owns every registered metric and the [`Registry`] they
//! belong to. The manager and scheduler update it alongside the in-process
//! ledger; `GET /metrics` renders it in text exposition format
//! (`text/plain; version=0.0.4`).

use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};

const PREFIX: &str = "gov_data_sync";

fn metric_name(suffix: &str) -> String {
    format!("{}_{}", PREFIX, suffix)
}

pub struct AppMetrics {
    /// Fetch calls by source and outcome (`success`, `error`, `cache_hit`).
    pub fetch_total: CounterVec,
    /// Upstream fetch latency in seconds, by source.
    pub fetch_duration: HistogramVec,
    /// Scheduled or forced sync attempts by source and outcome.
    pub sync_attempts_total: CounterVec,
    /// Times a caller had to wait for a rate-limit token.
    pub rate_limit_waits_total: CounterVec,
    /// Entries currently held in the cache, expired ones included.
    pub cache_entries: Gauge,
    pub registry: Registry,
}

impl AppMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let fetch_total = CounterVec::new(
            Opts::new(metric_name("fetch_total"), "Fetch calls by source and outcome"),
            &["source", "outcome"],
        )?;

        let fetch_duration = HistogramVec::new(
            HistogramOpts::new(
                metric_name("fetch_duration_seconds"),
                "Upstream fetch latency in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["source"],
        )?;

        let sync_attempts_total = CounterVec::new(
            Opts::new(
                metric_name("sync_attempts_total"),
                "Sync attempts by source and outcome",
            ),
            &["source", "outcome"],
        )?;

        let rate_limit_waits_total = CounterVec::new(
            Opts::new(
                metric_name("rate_limit_waits_total"),
                "Fetches delayed by an empty token bucket",
            ),
            &["source"],
        )?;

        let cache_entries = Gauge::with_opts(Opts::new(
            metric_name("cache_entries"),
            "Entries currently held in the read-through cache",
        ))?;

        registry.register(Box::new(fetch_total.clone()))?;
        registry.register(Box::new(fetch_duration.clone()))?;
        registry.register(Box::new(sync_attempts_total.clone()))?;
        registry.register(Box::new(rate_limit_waits_total.clone()))?;
        registry.register(Box::new(cache_entries.clone()))?;

        Ok(Self {
            fetch_total,
            fetch_duration,
            sync_attempts_total,
            rate_limit_waits_total,
            cache_entries,
            registry,
        })
    }

    pub fn record_fetch(&self, source: &str, outcome: &str) {
        self.fetch_total.with_label_values(&[source, outcome]).inc();
    }

    pub fn observe_fetch_duration(&self, source: &str, seconds: f64) {
        self.fetch_duration.with_label_values(&[source]).observe(seconds);
    }

    pub fn record_sync(&self, source: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.sync_attempts_total
            .with_label_values(&[source, outcome])
            .inc();
    }

    pub fn record_rate_limit_wait(&self, source: &str) {
        self.rate_limit_waits_total.with_label_values(&[source]).inc();
    }

    /// Render all metrics as Prometheus text format (for the `/metrics` endpoint).
    pub fn render(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&metric_families, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap_or_default())
    }
}
