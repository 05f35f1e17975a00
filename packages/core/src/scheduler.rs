//! Background refresh scheduler.
//!
//! Each tick collects the sources whose `next_update_at` has passed, orders
//! them by priority (stable for ties) and syncs them one at a time so that
//! rate-limited upstreams are never hit in parallel by the scheduler itself.
//!
//! A sync is a health probe followed by a forced re-fetch of every configured
//! sync target. Failures feed the source's retry policy: a retry is a
//! deferred timer task, and once the retry budget for the cycle is spent the
//! source waits for its next natural update.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::error::DataSourceError;
use crate::ledger::RequestMetric;
use crate::manager::Manager;
use crate::registry::RegisteredSource;
use crate::schedule::{FailureAction, SyncState, SyncStatus};
use crate::source::Params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced,
    RetryScheduled { attempt: u32, delay_ms: u64, error: DataSourceError },
    Exhausted { error: DataSourceError },
}

impl SyncOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Synced)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub source: String,
    pub duration_ms: f64,
    pub outcome: SyncOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub due: usize,
    pub reports: Vec<SyncReport>,
}

type BoxedSync<'a> = Pin<Box<dyn Future<Output = SyncReport> + Send + 'a>>;

#[derive(Clone)]
pub struct RefreshScheduler {
    manager: Arc<Manager>,
    tick_interval: Duration,
    initial_sync: bool,
    lifecycle: Arc<watch::Sender<Lifecycle>>,
}

impl RefreshScheduler {
    pub fn new(manager: Arc<Manager>, tick_interval: Duration, initial_sync: bool) -> Self {
        let (lifecycle, _) = watch::channel(Lifecycle::Idle);
        Self {
            manager,
            tick_interval,
            initial_sync,
            lifecycle: Arc::new(lifecycle),
        }
    }

    pub fn is_running(&self) -> bool {
        *self.lifecycle.borrow() == Lifecycle::Running
    }

    fn is_stopped(&self) -> bool {
        *self.lifecycle.borrow() == Lifecycle::Stopped
    }

    /// Spawn the refresh loop: optional warm-up, then one tick per interval
    /// (the first immediately) until [`stop`](Self::stop).
    pub fn start(&self) -> JoinHandle<()> {
        self.lifecycle.send_replace(Lifecycle::Running);
        let this = self.clone();
        tokio::spawn(async move { this.run_loop().await })
    }

    /// Stop scheduling new work. A tick in progress finishes its current
    /// source; pending retry timers settle their source without syncing.
    pub fn stop(&self) {
        if self.lifecycle.send_replace(Lifecycle::Stopped) == Lifecycle::Running {
            tracing::info!("Refresh scheduler stopping");
        }
    }

    /// Resolves once [`stop`](Self::stop) has been called.
    pub async fn stopped(&self) {
        let mut rx = self.lifecycle.subscribe();
        let _ = rx.wait_for(|state| *state == Lifecycle::Stopped).await;
    }

    async fn run_loop(&self) {
        tracing::info!(
            "Refresh scheduler started (tick: {}s)",
            self.tick_interval.as_secs_f64()
        );

        if self.initial_sync {
            tokio::select! {
                _ = self.initial_sync() => {}
                _ = self.stopped() => {}
            }
        }

        let mut interval = time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.is_stopped() {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report.due > 0 {
                        tracing::debug!(
                            due = report.due,
                            synced = report.reports.iter().filter(|r| r.outcome.is_success()).count(),
                            "tick complete"
                        );
                    }
                }
                _ = self.stopped() => break,
            }
        }

        tracing::info!("Refresh scheduler stopped cleanly");
    }

    /// Sync every due source, highest priority first, one at a time.
    pub async fn tick(&self) -> TickReport {
        let now = Instant::now();
        let mut due = Vec::new();
        for source in self.manager.registry().all().await {
            let record = source.schedule.lock().await;
            if record.is_due(now) {
                due.push((record.priority, Arc::clone(&source)));
            }
        }
        due.sort_by_key(|(priority, _)| *priority);

        let mut report = TickReport {
            due: due.len(),
            reports: Vec::with_capacity(due.len()),
        };
        for (_, source) in due {
            if self.is_stopped() {
                break;
            }
            report.reports.push(self.sync_source(source).await);
        }
        report
    }

    /// Warm up critical and high priority sources concurrently. Individual
    /// failures are left to the retry policy.
    pub async fn initial_sync(&self) -> Vec<SyncReport> {
        let mut tasks = JoinSet::new();
        for source in self.manager.registry().all().await {
            if !source.config.priority.is_warm_up() {
                continue;
            }
            let this = self.clone();
            tasks.spawn(async move { this.sync_source(source).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => tracing::error!("Initial sync task failed: {}", err),
            }
        }
        tracing::info!(
            synced = reports.iter().filter(|r| r.outcome.is_success()).count(),
            total = reports.len(),
            "Initial sync finished"
        );
        reports
    }

    /// Sync one source now, regardless of its schedule.
    pub async fn force_sync(&self, name: &str) -> Result<SyncReport, DataSourceError> {
        let source = self
            .manager
            .registry()
            .get(name)
            .await
            .ok_or_else(|| DataSourceError::not_found(name, "sync", &Params::new()))?;
        Ok(self.sync_source(source).await)
    }

    /// Sync every registered source in priority order.
    pub async fn force_sync_all(&self) -> Vec<SyncReport> {
        let mut sources = self.manager.registry().all().await;
        sources.sort_by_key(|source| source.config.priority);

        let mut reports = Vec::with_capacity(sources.len());
        for source in sources {
            reports.push(self.sync_source(source).await);
        }
        reports
    }

    /// Schedule snapshots in registration order.
    pub async fn sync_status(&self) -> Vec<SyncStatus> {
        let now = Instant::now();
        let mut statuses = Vec::new();
        for source in self.manager.registry().all().await {
            statuses.push(source.schedule.lock().await.snapshot(now));
        }
        statuses
    }

    async fn sync_source(&self, source: Arc<RegisteredSource>) -> SyncReport {
        source.schedule.lock().await.begin_attempt();
        self.complete_attempt(source).await
    }

    fn complete_attempt_boxed(&self, source: Arc<RegisteredSource>) -> BoxedSync<'_> {
        Box::pin(self.complete_attempt(source))
    }

    /// Run an attempt already marked as begun and settle the schedule record.
    async fn complete_attempt(&self, source: Arc<RegisteredSource>) -> SyncReport {
        let started = Instant::now();
        let result = self.attempt(&source).await;
        let elapsed = started.elapsed();
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        let now = Instant::now();

        let ledger = self.manager.ledger();
        let metrics = self.manager.metrics();

        let outcome = match result {
            Ok(()) => {
                source.schedule.lock().await.record_success(now, elapsed);
                ledger.record(&source.name, RequestMetric::sync(duration_ms, None)).await;
                metrics.record_sync(&source.name, true);
                tracing::info!(source = %source.name, duration_ms, "Source synced");
                SyncOutcome::Synced
            }
            Err(error) => {
                ledger
                    .record(&source.name, RequestMetric::sync(duration_ms, Some(&error)))
                    .await;
                metrics.record_sync(&source.name, false);

                let action = source.schedule.lock().await.record_failure(
                    now,
                    elapsed,
                    &error.message,
                    !error.is_permanent(),
                );
                match action {
                    FailureAction::Retry {
                        attempt,
                        delay,
                        retry_at,
                    } => {
                        tracing::warn!(
                            source = %source.name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Sync failed, retry scheduled: {}",
                            error.message
                        );
                        self.spawn_retry(Arc::clone(&source), retry_at);
                        SyncOutcome::RetryScheduled {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            error,
                        }
                    }
                    FailureAction::Exhausted => {
                        tracing::error!(
                            source = %source.name,
                            permanent = error.is_permanent(),
                            "Sync failed, waiting for next cycle: {}",
                            error.message
                        );
                        SyncOutcome::Exhausted { error }
                    }
                }
            }
        };

        SyncReport {
            source: source.name.clone(),
            duration_ms,
            outcome,
        }
    }

    async fn attempt(&self, source: &RegisteredSource) -> Result<(), DataSourceError> {
        let health = source.adapter.health_check().await;
        if !health.is_healthy() {
            return Err(DataSourceError::unhealthy(&source.name, &health));
        }

        for target in &source.config.sync_targets {
            self.manager
                .fetch(&source.name, &target.endpoint, &target.params, true)
                .await?;
        }
        Ok(())
    }

    fn spawn_retry(&self, source: Arc<RegisteredSource>, retry_at: Instant) {
        let this = self.clone();
        tokio::spawn(async move {
            time::sleep_until(retry_at).await;

            // Re-registration replaces the record this timer belongs to.
            match this.manager.registry().get(&source.name).await {
                Some(current) if Arc::ptr_eq(&current, &source) => {}
                _ => return,
            }

            {
                let mut record = source.schedule.lock().await;
                if record.state != (SyncState::PendingRetry { retry_at }) {
                    return;
                }
                if this.is_stopped() {
                    record.abandon_retry(Instant::now());
                    tracing::debug!(source = %source.name, "scheduler stopped, retry dropped");
                    return;
                }
                record.begin_attempt();
            }

            this.complete_attempt_boxed(source).await;
        });
    }
}
