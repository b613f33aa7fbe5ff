//! Step Rate Limiting
//!
//! Token bucket per step. A bucket holds at most `rate.count` tokens and
//! refills continuously at `rate.count / rate.per`. When a bucket is empty
//! the step's strategy decides: `drop` fails the operation with
//! `ErrRateLimited`, `queue` waits for the next token.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use surge_core::{Rate, StepIndex, SurgeError};

/// What happens to an operation that finds its bucket empty
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitStrategy {
    #[default]
    Drop,
    Queue,
}

/// Per-step limit as declared on the step
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub rate: Rate,
    #[serde(default)]
    pub strategy: LimitStrategy,
}

impl RateLimit {
    pub fn new(rate: Rate, strategy: LimitStrategy) -> Self {
        Self { rate, strategy }
    }
}

struct TokenBucket {
    limit: RateLimit,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            tokens: limit.rate.count as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let capacity = self.limit.rate.count as f64;
        let earned = elapsed.as_secs_f64() * self.limit.rate.per_second();
        self.tokens = (self.tokens + earned).min(capacity);
        self.last_refill = now;
    }

    /// Take one token, or report how long until one is available
    fn take(&mut self) -> Result<(), Duration> {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let per_second = self.limit.rate.per_second();
        if per_second <= 0.0 {
            return Err(self.limit.rate.per);
        }
        Err(Duration::from_secs_f64((1.0 - self.tokens) / per_second))
    }
}

/// Buckets for every rate-limited step of one run
#[derive(Default)]
pub struct StepLimiter {
    buckets: DashMap<StepIndex, TokenBucket>,
}

impl StepLimiter {
    pub fn new(limits: impl IntoIterator<Item = (StepIndex, RateLimit)>) -> Self {
        let buckets = DashMap::new();
        for (step, limit) in limits {
            buckets.insert(step, TokenBucket::new(limit));
        }
        Self { buckets }
    }

    /// Try to take a token without waiting; unlimited steps always pass
    pub fn check(&self, step: StepIndex) -> bool {
        match self.buckets.get_mut(&step) {
            Some(mut bucket) => bucket.take().is_ok(),
            None => true,
        }
    }

    /// Admit one operation of `step` according to its strategy
    pub async fn admit(
        &self,
        step: StepIndex,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SurgeError> {
        loop {
            let wait = match self.buckets.get_mut(&step) {
                None => return Ok(()),
                Some(mut bucket) => match bucket.take() {
                    Ok(()) => return Ok(()),
                    Err(_) if bucket.limit.strategy == LimitStrategy::Drop => {
                        return Err(SurgeError::RateLimited(name.to_string()))
                    }
                    Err(wait) => wait,
                },
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SurgeError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Whole tokens left for `step`, `None` when it is unlimited
    pub fn remaining(&self, step: StepIndex) -> Option<u64> {
        self.buckets.get_mut(&step).map(|mut bucket| {
            bucket.refill(Instant::now());
            bucket.tokens.floor() as u64
        })
    }
}
