//! Per-source token bucket.
//!
//! Tokens are continuous: every acquire attempt first refills
//! `elapsed_seconds * refill_rate`, capped at capacity. A caller is admitted
//! when at least one whole token is available and pays exactly one.
//! Otherwise it sleeps `1 / refill_rate` seconds and tries again.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};

use crate::source::RateLimit;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterError {
    #[error("no rate-limit token within {waited_ms}ms")]
    Timeout { waited_ms: u64 },
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_at: Instant,
}

#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    /// A full bucket holding `capacity` tokens, refilled at `refill_rate` per second.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill_at: Instant::now(),
            }),
        }
    }

    pub fn from_rate_limit(rate_limit: &RateLimit) -> Self {
        Self::new(rate_limit.requests, rate_limit.refill_rate())
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Sleep between attempts while the bucket is empty. Saturates at
    /// `Duration::MAX` for refill rates too slow to represent.
    pub fn wait_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.refill_rate).unwrap_or(Duration::MAX)
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill_at = now;
    }

    /// Take a token if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then consume it.
    ///
    /// Returns how long the caller was held back. There is no upper bound on
    /// the wait; use [`acquire_within`](Self::acquire_within) for one.
    /// Dropping the future abandons the wait without consuming a token.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        loop {
            if self.try_acquire().await {
                return started.elapsed();
            }
            let wait = self.wait_interval();
            tracing::debug!(
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "rate limit bucket empty, waiting for refill"
            );
            time::sleep(wait).await;
        }
    }

    /// [`acquire`](Self::acquire) with a deadline.
    pub async fn acquire_within(&self, max_wait: Duration) -> Result<Duration, LimiterError> {
        time::timeout(max_wait, self.acquire())
            .await
            .map_err(|_| LimiterError::Timeout {
                waited_ms: max_wait.as_millis() as u64,
            })
    }

    /// Current token count after refilling.
    pub async fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        state.tokens
    }
}
