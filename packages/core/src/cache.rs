//! Read-through response cache with absolute expiry.
//!
//! Entries are immutable once written; a later write under the same key
//! supersedes the old entry. Expired entries are never returned: `get`
//! checks expiry at read time and evicts lazily, `sweep_expired` reclaims
//! memory in bulk. There is no size bound beyond TTL.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus::Gauge;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::source::Params;

pub const REAL_TIME_TTL: Duration = Duration::from_secs(5 * 60);
pub const DAILY_TTL: Duration = Duration::from_secs(60 * 60);
pub const WEEKLY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MONTHLY_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL derived from the endpoint string alone.
///
/// Substring classes are checked in order: `real-time`/`rates`, then
/// `daily`/`market`, `weekly`, `monthly`. Anything else gets a day.
// TODO: replace the substring heuristic with an explicit per-endpoint TTL table in SourceConfig.
pub fn ttl_for_endpoint(endpoint: &str) -> Duration {
    if endpoint.contains("real-time") || endpoint.contains("rates") {
        REAL_TIME_TTL
    } else if endpoint.contains("daily") || endpoint.contains("market") {
        DAILY_TTL
    } else if endpoint.contains("weekly") {
        WEEKLY_TTL
    } else if endpoint.contains("monthly") {
        MONTHLY_TTL
    } else {
        DEFAULT_TTL
    }
}

/// Deterministic key for `(source, endpoint, params)`.
pub fn cache_key(source: &str, endpoint: &str, params: &Params) -> String {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    endpoint.hash(&mut hasher);
    params.hash(&mut hasher);
    format!("{}:{}:{:016x}", source, endpoint, hasher.finish())
}

/// Where a cached value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryOrigin {
    pub source_name: String,
    pub endpoint: String,
    pub params: Params,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: Instant,
    pub expires_at: Instant,
    /// Monotonic write sequence number across the whole cache.
    pub generation: u64,
    pub origin: Option<EntryOrigin>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
}

/// Thread-safe in-memory cache shared by the manager and the scheduler.
#[derive(Debug, Clone, Default)]
pub struct ReadThroughCache {
    entries: Arc<RwLock<HashMap<String, Arc<CacheEntry>>>>,
    generation: Arc<AtomicU64>,
    size_gauge: Option<Gauge>,
}

impl ReadThroughCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `gauge` equal to the entry count on every insert and removal.
    pub fn with_size_gauge(mut self, gauge: Gauge) -> Self {
        self.size_gauge = Some(gauge);
        self
    }

    fn publish_len(&self, len: usize) {
        if let Some(gauge) = &self.size_gauge {
            gauge.set(len as f64);
        }
    }

    /// Returns the cached value only when still within TTL.
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entry(key).await.map(|entry| entry.value.clone())
    }

    /// Returns the live entry for `key`, evicting it if it has expired.
    pub async fn entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.clone()),
                Some(_) => {}
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(key);
            self.publish_len(entries.len());
        }
        None
    }

    pub async fn put(&self, key: String, value: Value, ttl: Duration) -> Arc<CacheEntry> {
        self.insert(key, value, ttl, None).await
    }

    /// Store a fetched payload under its derived key and endpoint TTL.
    pub async fn put_fetched(
        &self,
        source_name: &str,
        endpoint: &str,
        params: &Params,
        value: Value,
    ) -> Arc<CacheEntry> {
        let origin = EntryOrigin {
            source_name: source_name.to_string(),
            endpoint: endpoint.to_string(),
            params: params.clone(),
        };
        self.insert(
            cache_key(source_name, endpoint, params),
            value,
            ttl_for_endpoint(endpoint),
            Some(origin),
        )
        .await
    }

    async fn insert(
        &self,
        key: String,
        value: Value,
        ttl: Duration,
        origin: Option<EntryOrigin>,
    ) -> Arc<CacheEntry> {
        let mut entries = self.entries.write().await;
        let created_at = Instant::now();
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            value,
            created_at,
            expires_at: created_at + ttl,
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            origin,
        });
        entries.insert(key, entry.clone());
        self.publish_len(entries.len());
        entry
    }

    /// Sequence number of the most recent write.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(key).is_some();
        self.publish_len(entries.len());
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let expired = entries.values().filter(|entry| entry.is_expired(now)).count();
        CacheStats {
            total: entries.len(),
            valid: entries.len() - expired,
            expired,
        }
    }

    /// Remove expired entries, returning how many were dropped.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        self.publish_len(entries.len());
        before - entries.len()
    }

    /// Number of entries, including expired ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
        self.publish_len(0);
    }
}
