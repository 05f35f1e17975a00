//! Per-source schedule bookkeeping.
//!
//! A [`ScheduleRecord`] is the only state that decides when a source is
//! refreshed next. It is mutated exclusively by the scheduler after each
//! attempt; `next_update_at` alone governs eligibility for a tick.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::source::SourceConfig;

/// Upper bound on a single retry delay (one day).
const MAX_BACKOFF_MS: f64 = 86_400_000.0;

/// Refresh priority. Declaration order is processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Sources warmed up concurrently when the scheduler starts.
    pub const fn is_warm_up(self) -> bool {
        matches!(self, Self::Critical | Self::High)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// How often a source publishes new data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    #[serde(alias = "real-time", alias = "realtime")]
    RealTime,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Annually,
}

impl UpdateFrequency {
    pub const fn as_duration(self) -> Duration {
        match self {
            Self::RealTime => Duration::from_secs(5 * 60),
            Self::Hourly => Duration::from_secs(60 * 60),
            Self::Daily => Duration::from_secs(24 * 60 * 60),
            Self::Weekly => Duration::from_secs(7 * 24 * 60 * 60),
            Self::Monthly => Duration::from_secs(30 * 24 * 60 * 60),
            Self::Annually => Duration::from_secs(365 * 24 * 60 * 60),
        }
    }
}

/// Retry budget and exponential backoff for failed syncs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Spread delays by +/- 20%.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, initial_delay_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_retries,
            initial_delay_ms,
            backoff_multiplier,
            jitter: false,
        }
    }

    /// Delay before the retry that follows the `consecutive_failures`-th failure.
    ///
    /// The first failure waits `initial_delay_ms`, each further one multiplies
    /// by `backoff_multiplier`.
    pub fn delay_for_failure(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let mut millis = scaled.min(MAX_BACKOFF_MS);

        if self.jitter {
            millis *= rand::thread_rng().gen_range(0.8..=1.2);
        }

        Duration::from_millis(millis.round() as u64)
    }
}

/// Where a source sits in the refresh state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    PendingRetry { retry_at: Instant },
}

/// What the scheduler should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry {
        attempt: u32,
        delay: Duration,
        retry_at: Instant,
    },
    Exhausted,
}

/// Bookkeeping for one registered source.
#[derive(Debug, Clone)]
pub struct ScheduleRecord {
    pub source: String,
    pub frequency: UpdateFrequency,
    pub priority: Priority,
    pub retry_on_failure: bool,
    pub retry_policy: RetryPolicy,
    pub last_update_at: Option<Instant>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_update_at: Instant,
    pub consecutive_failures: u32,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub average_duration_ms: f64,
    pub retries_in_cycle: u32,
    pub state: SyncState,
    pub last_error: Option<String>,
}

impl ScheduleRecord {
    /// A new record is due immediately.
    pub fn new(source: &str, config: &SourceConfig, now: Instant) -> Self {
        Self {
            source: source.to_string(),
            frequency: config.update_frequency,
            priority: config.priority,
            retry_on_failure: config.retry_on_failure,
            retry_policy: config.retry_config,
            last_update_at: None,
            last_success_at: None,
            next_update_at: now,
            consecutive_failures: 0,
            total_attempts: 0,
            successful_attempts: 0,
            average_duration_ms: 0.0,
            retries_in_cycle: 0,
            state: SyncState::Idle,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.state == SyncState::Idle && self.next_update_at <= now
    }

    pub fn begin_attempt(&mut self) {
        self.state = SyncState::Syncing;
        self.total_attempts += 1;
    }

    pub fn record_success(&mut self, now: Instant, duration: Duration) {
        self.track_duration(duration);
        self.consecutive_failures = 0;
        self.successful_attempts += 1;
        self.retries_in_cycle = 0;
        self.last_update_at = Some(now);
        self.last_success_at = Some(Utc::now());
        self.last_error = None;
        self.close_cycle(now);
    }

    /// Count the failure and decide between a deferred retry and giving up
    /// until the next natural cycle.
    pub fn record_failure(
        &mut self,
        now: Instant,
        duration: Duration,
        message: &str,
        retryable: bool,
    ) -> FailureAction {
        self.track_duration(duration);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(message.to_string());

        if self.retry_on_failure && retryable && self.retries_in_cycle < self.retry_policy.max_retries {
            self.retries_in_cycle += 1;
            let delay = self.retry_policy.delay_for_failure(self.consecutive_failures);
            let retry_at = now + delay;
            self.state = SyncState::PendingRetry { retry_at };
            return FailureAction::Retry {
                attempt: self.retries_in_cycle,
                delay,
                retry_at,
            };
        }

        self.retries_in_cycle = 0;
        self.close_cycle(now);
        FailureAction::Exhausted
    }

    /// Give up on a pending retry without another attempt.
    pub fn abandon_retry(&mut self, now: Instant) {
        self.retries_in_cycle = 0;
        self.close_cycle(now);
    }

    fn close_cycle(&mut self, now: Instant) {
        self.next_update_at = now + self.frequency.as_duration();
        self.state = SyncState::Idle;
    }

    fn track_duration(&mut self, duration: Duration) {
        let sample = duration.as_secs_f64() * 1000.0;
        let n = self.total_attempts.max(1) as f64;
        self.average_duration_ms += (sample - self.average_duration_ms) / n;
    }

    pub fn snapshot(&self, now: Instant) -> SyncStatus {
        let (phase, retry_in_ms) = match self.state {
            SyncState::Idle => (SyncPhase::Idle, None),
            SyncState::Syncing => (SyncPhase::Syncing, None),
            SyncState::PendingRetry { retry_at } => (
                SyncPhase::PendingRetry,
                Some(millis_until(now, retry_at)),
            ),
        };

        SyncStatus {
            source: self.source.clone(),
            priority: self.priority,
            frequency: self.frequency,
            phase,
            retry_in_ms,
            last_success_at: self.last_success_at,
            next_update_in_ms: millis_until(now, self.next_update_at),
            consecutive_failures: self.consecutive_failures,
            total_attempts: self.total_attempts,
            successful_attempts: self.successful_attempts,
            average_duration_ms: self.average_duration_ms,
            retries_in_cycle: self.retries_in_cycle,
            last_error: self.last_error.clone(),
        }
    }
}

fn millis_until(now: Instant, at: Instant) -> u64 {
    at.saturating_duration_since(now).as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Syncing,
    PendingRetry,
}

/// Serializable view of a [`ScheduleRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub source: String,
    pub priority: Priority,
    pub frequency: UpdateFrequency,
    pub phase: SyncPhase,
    pub retry_in_ms: Option<u64>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub next_update_in_ms: u64,
    pub consecutive_failures: u32,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub average_duration_ms: f64,
    pub retries_in_cycle: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RateLimit;

    fn config(frequency: UpdateFrequency, policy: RetryPolicy) -> SourceConfig {
        SourceConfig::new(RateLimit::new(5, 1.0), frequency, Priority::High).with_retry(policy)
    }

    #[test]
    fn priorities_sort_critical_first() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[test]
    fn frequency_durations() {
        assert_eq!(UpdateFrequency::RealTime.as_duration(), Duration::from_secs(300));
        assert_eq!(UpdateFrequency::Hourly.as_duration(), Duration::from_secs(3_600));
        assert_eq!(UpdateFrequency::Daily.as_duration(), Duration::from_secs(86_400));
        assert_eq!(UpdateFrequency::Weekly.as_duration(), Duration::from_secs(604_800));
        assert_eq!(UpdateFrequency::Monthly.as_duration(), Duration::from_secs(2_592_000));
        assert_eq!(UpdateFrequency::Annually.as_duration(), Duration::from_secs(31_536_000));
    }

    #[test]
    fn nth_retry_delay_doubles() {
        let policy = RetryPolicy::new(5, 1_000, 2.0);
        for n in 1..=5u32 {
            assert_eq!(
                policy.delay_for_failure(n),
                Duration::from_millis(1_000 * 2u64.pow(n - 1))
            );
        }
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::new(100, 1_000, 10.0);
        assert_eq!(policy.delay_for_failure(60), Duration::from_secs(86_400));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::new(3, 1_000, 2.0)
        };
        for _ in 0..50 {
            let delay = policy.delay_for_failure(2).as_millis();
            assert!((1_600..=2_400).contains(&delay), "delay {} out of range", delay);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failures_and_schedules_next_cycle() {
        let now = Instant::now();
        let mut record = ScheduleRecord::new("boc", &config(UpdateFrequency::Hourly, RetryPolicy::default()), now);
        record.begin_attempt();
        record.record_failure(now, Duration::from_millis(10), "boom", true);
        assert_eq!(record.consecutive_failures, 1);

        record.begin_attempt();
        record.record_success(now, Duration::from_millis(30));

        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.retries_in_cycle, 0);
        assert_eq!(record.successful_attempts, 1);
        assert_eq!(record.total_attempts, 2);
        assert_eq!(record.state, SyncState::Idle);
        assert_eq!(record.next_update_at, now + Duration::from_secs(3_600));
        assert!((record.average_duration_ms - 20.0).abs() < 1e-9);
        assert!(record.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_retry_until_budget_is_spent() {
        let now = Instant::now();
        let policy = RetryPolicy::new(2, 1_000, 2.0);
        let mut record = ScheduleRecord::new("boc", &config(UpdateFrequency::Daily, policy), now);

        record.begin_attempt();
        let first = record.record_failure(now, Duration::ZERO, "down", true);
        assert_eq!(
            first,
            FailureAction::Retry {
                attempt: 1,
                delay: Duration::from_millis(1_000),
                retry_at: now + Duration::from_millis(1_000),
            }
        );
        assert!(!record.is_due(now + Duration::from_secs(3_600 * 48)));

        record.begin_attempt();
        let second = record.record_failure(now, Duration::ZERO, "down", true);
        assert!(matches!(second, FailureAction::Retry { attempt: 2, delay, .. } if delay == Duration::from_millis(2_000)));

        record.begin_attempt();
        let third = record.record_failure(now, Duration::ZERO, "down", true);
        assert_eq!(third, FailureAction::Exhausted);
        assert_eq!(record.state, SyncState::Idle);
        assert_eq!(record.consecutive_failures, 3);
        assert_eq!(record.next_update_at, now + Duration::from_secs(86_400));
        assert!(!record.is_due(now));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_closes_the_cycle() {
        let now = Instant::now();
        let mut record = ScheduleRecord::new("boc", &config(UpdateFrequency::Hourly, RetryPolicy::default()), now);
        record.begin_attempt();

        let action = record.record_failure(now, Duration::ZERO, "bad request", false);

        assert_eq!(action, FailureAction::Exhausted);
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.next_update_at, now + Duration::from_secs(3_600));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_disabled_never_schedules_retry() {
        let now = Instant::now();
        let cfg = config(UpdateFrequency::Hourly, RetryPolicy::default()).without_retry();
        let mut record = ScheduleRecord::new("boc", &cfg, now);
        record.begin_attempt();

        assert_eq!(
            record.record_failure(now, Duration::ZERO, "down", true),
            FailureAction::Exhausted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reports_pending_retry() {
        let now = Instant::now();
        let mut record = ScheduleRecord::new("boc", &config(UpdateFrequency::Hourly, RetryPolicy::default()), now);
        record.begin_attempt();
        record.record_failure(now, Duration::ZERO, "down", true);

        let status = record.snapshot(now);
        assert_eq!(status.phase, SyncPhase::PendingRetry);
        assert_eq!(status.retry_in_ms, Some(1_000));
        assert_eq!(status.last_error.as_deref(), Some("down"));
    }
}
