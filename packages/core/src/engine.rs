//! The refresh engine: one explicit owner for the registry, cache, ledger,
//! metrics and scheduler of a process.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::CacheStats;
use crate::config::EngineConfig;
use crate::error::{AppError, DataSourceError};
use crate::ledger::{LedgerSummary, PerformanceMetrics, SourceHealth};
use crate::manager::{DataValidator, Manager};
use crate::metrics::AppMetrics;
use crate::registry::Registration;
use crate::scheduler::{RefreshScheduler, SyncReport, TickReport};
use crate::schedule::SyncStatus;
use crate::source::{DataSource, Params, SourceConfig};

pub struct Engine {
    config: EngineConfig,
    manager: Arc<Manager>,
    scheduler: RefreshScheduler,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, AppError> {
        Self::build(config, None)
    }

    pub fn with_validator(
        config: EngineConfig,
        validator: Arc<dyn DataValidator>,
    ) -> Result<Self, AppError> {
        Self::build(config, Some(validator))
    }

    fn build(
        config: EngineConfig,
        validator: Option<Arc<dyn DataValidator>>,
    ) -> Result<Self, AppError> {
        let metrics = Arc::new(AppMetrics::new()?);
        let mut manager = Manager::new(
            metrics,
            config.ledger_capacity_per_source,
            config.max_rate_limit_wait,
        );
        if let Some(validator) = validator {
            manager = manager.with_validator(validator);
        }
        let manager = Arc::new(manager);
        let scheduler =
            RefreshScheduler::new(Arc::clone(&manager), config.tick_interval, config.initial_sync);

        Ok(Self {
            config,
            manager,
            scheduler,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn register_data_source(
        &self,
        name: &str,
        adapter: Arc<dyn DataSource>,
        config: SourceConfig,
    ) -> Result<Registration, DataSourceError> {
        self.manager.register_data_source(name, adapter, config).await
    }

    pub async fn fetch(
        &self,
        source_name: &str,
        endpoint: &str,
        params: &Params,
        force_refresh: bool,
    ) -> Result<Value, DataSourceError> {
        self.manager
            .fetch(source_name, endpoint, params, force_refresh)
            .await
    }

    pub async fn fetch_as<T: DeserializeOwned>(
        &self,
        source_name: &str,
        endpoint: &str,
        params: &Params,
        force_refresh: bool,
    ) -> Result<T, DataSourceError> {
        self.manager
            .fetch_as(source_name, endpoint, params, force_refresh)
            .await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.manager.cache_stats().await
    }

    pub async fn performance_metrics(&self, source_name: &str) -> PerformanceMetrics {
        self.manager.performance_metrics(source_name).await
    }

    pub async fn source_health(&self, source_name: &str) -> SourceHealth {
        self.manager.ledger().health(source_name).await
    }

    pub async fn sync_status(&self) -> Vec<SyncStatus> {
        self.scheduler.sync_status().await
    }

    pub async fn force_sync(&self, source_name: &str) -> Result<SyncReport, DataSourceError> {
        self.scheduler.force_sync(source_name).await
    }

    pub async fn force_sync_all(&self) -> Vec<SyncReport> {
        self.scheduler.force_sync_all().await
    }

    pub async fn tick(&self) -> TickReport {
        self.scheduler.tick().await
    }

    pub async fn summary(&self) -> LedgerSummary {
        self.manager.ledger().summary().await
    }

    pub async fn source_names(&self) -> Vec<String> {
        self.manager.registry().names().await
    }

    pub async fn is_registered(&self, source_name: &str) -> bool {
        self.manager.registry().contains(source_name).await
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn metrics(&self) -> &Arc<AppMetrics> {
        self.manager.metrics()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start the scheduler loop and, when configured, the cache sweeper.
    /// Calling it while already running does nothing.
    pub async fn start(&self) {
        if self.scheduler.is_running() {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.scheduler.start());
        if let Some(every) = self.config.cache_sweep_interval {
            tasks.push(self.spawn_sweeper(every));
        }
    }

    /// Signal background tasks to stop. In-flight work drains on its own.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// [`stop`](Self::stop) and wait for the loop tasks to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!("Background task ended abnormally: {}", err);
            }
        }
        tracing::info!("Engine shut down");
    }

    fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = manager.cache().sweep_expired().await;
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired cache entries");
                        }
                    }
                    _ = scheduler.stopped() => break,
                }
            }
        })
    }
}
