//! Named source bindings.
//!
//! Each registered source owns its adapter handle, its token bucket and its
//! schedule record. Registering a name again replaces the whole binding, so
//! there is never more than one schedule record per name.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::limiter::TokenBucketLimiter;
use crate::schedule::ScheduleRecord;
use crate::source::{DataSource, SourceConfig};

pub struct RegisteredSource {
    pub name: String,
    pub adapter: Arc<dyn DataSource>,
    pub limiter: Arc<TokenBucketLimiter>,
    pub config: SourceConfig,
    pub schedule: Mutex<ScheduleRecord>,
    /// Position of the first registration under this name.
    pub order: u64,
}

impl std::fmt::Debug for RegisteredSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSource")
            .field("name", &self.name)
            .field("adapter", &self.adapter.name())
            .field("config", &self.config)
            .field("order", &self.order)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    Replaced,
}

#[derive(Default)]
struct RegistryInner {
    sources: HashMap<String, Arc<RegisteredSource>>,
    next_order: u64,
}

#[derive(Default)]
pub struct SourceRegistry {
    inner: RwLock<RegistryInner>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `adapter`. The caller validates `config` first.
    pub async fn register(
        &self,
        name: &str,
        adapter: Arc<dyn DataSource>,
        config: SourceConfig,
    ) -> Registration {
        let mut inner = self.inner.write().await;

        let (order, registration) = match inner.sources.get(name) {
            Some(existing) => (existing.order, Registration::Replaced),
            None => {
                let order = inner.next_order;
                inner.next_order += 1;
                (order, Registration::Added)
            }
        };

        let source = RegisteredSource {
            name: name.to_string(),
            adapter,
            limiter: Arc::new(TokenBucketLimiter::from_rate_limit(&config.rate_limit)),
            schedule: Mutex::new(ScheduleRecord::new(name, &config, Instant::now())),
            config,
            order,
        };
        inner.sources.insert(name.to_string(), Arc::new(source));
        registration
    }

    pub async fn get(&self, name: &str) -> Option<Arc<RegisteredSource>> {
        self.inner.read().await.sources.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.read().await.sources.contains_key(name)
    }

    /// All bindings in first-registration order.
    pub async fn all(&self) -> Vec<Arc<RegisteredSource>> {
        let inner = self.inner.read().await;
        let mut sources: Vec<_> = inner.sources.values().cloned().collect();
        sources.sort_by_key(|source| source.order);
        sources
    }

    pub async fn names(&self) -> Vec<String> {
        self.all()
            .await
            .into_iter()
            .map(|source| source.name.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sources.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{Priority, UpdateFrequency};
    use crate::services::mock_source::MockSource;
    use crate::source::RateLimit;

    fn config(priority: Priority, requests: u32) -> SourceConfig {
        SourceConfig::new(RateLimit::new(requests, 60.0), UpdateFrequency::Daily, priority)
    }

    #[tokio::test]
    async fn re_registering_replaces_the_binding() {
        let registry = SourceRegistry::new();
        let first = registry
            .register("boc", Arc::new(MockSource::new("boc")), config(Priority::Low, 5))
            .await;
        let second = registry
            .register("boc", Arc::new(MockSource::new("boc")), config(Priority::Critical, 50))
            .await;

        assert_eq!(first, Registration::Added);
        assert_eq!(second, Registration::Replaced);
        assert_eq!(registry.len().await, 1);

        let source = registry.get("boc").await.unwrap();
        assert_eq!(source.config.priority, Priority::Critical);
        assert_eq!(source.limiter.capacity(), 50.0);
        assert_eq!(source.schedule.lock().await.priority, Priority::Critical);
    }

    #[tokio::test]
    async fn replacement_keeps_original_registration_order() {
        let registry = SourceRegistry::new();
        for name in ["statcan", "boc", "opendata"] {
            registry
                .register(name, Arc::new(MockSource::new(name)), config(Priority::Medium, 5))
                .await;
        }
        registry
            .register("statcan", Arc::new(MockSource::new("statcan")), config(Priority::High, 5))
            .await;

        assert_eq!(registry.names().await, vec!["statcan", "boc", "opendata"]);
    }

    #[tokio::test]
    async fn unknown_name_is_absent() {
        let registry = SourceRegistry::new();
        assert!(registry.get("nope").await.is_none());
        assert!(!registry.contains("nope").await);
        assert!(registry.is_empty().await);
    }
}
