//! Per-item and overall retry delays for [`WorkQueue`](super::WorkQueue).

use std::{collections::HashMap, hash::Hash, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use thiserror::Error;
use tokio::time::Instant;

/// Decides how long an item has to wait before it is retried.
pub trait RateLimiter<T>: Send {
    /// Records a retry of `item` and returns how long it should be delayed.
    fn when(&mut self, item: &T) -> Duration;

    /// Clears the failure history of `item`.
    fn forget(&mut self, item: &T);

    /// Number of retries recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &T) -> u32;
}

struct Failures {
    backoff: ExponentialBackoff,
    count: u32,
}

/// Delays `base * 2^failures`, capped at `max`.
pub struct ExponentialFailureRateLimiter<T> {
    base: Duration,
    max: Duration,
    failures: HashMap<T, Failures>,
}

impl<T> ExponentialFailureRateLimiter<T> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }
}

fn doubling_backoff(base: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(base)
        .with_multiplier(2.0)
        .with_randomization_factor(0.0)
        .with_max_interval(max)
        .with_max_elapsed_time(None)
        .build()
}

impl<T: Clone + Eq + Hash + Send> RateLimiter<T> for ExponentialFailureRateLimiter<T> {
    fn when(&mut self, item: &T) -> Duration {
        let (base, max) = (self.base, self.max);
        let failures = self.failures.entry(item.clone()).or_insert_with(|| Failures {
            backoff: doubling_backoff(base, max),
            count: 0,
        });
        failures.count = failures.count.saturating_add(1);

        // without an elapsed time limit the backoff never gives up
        failures
            .backoff
            .next_backoff()
            .map_or(max, |delay| delay.min(max))
    }

    fn forget(&mut self, item: &T) {
        self.failures.remove(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item).map_or(0, |failures| failures.count)
    }
}

#[derive(Debug, Error)]
#[error("Rate limiter needs a positive rate, got {0} qps")]
pub struct InvalidRate(f64);

/// Token bucket shared by all items, limiting the overall retry rate.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Result<Self, InvalidRate> {
        if qps.is_nan() || qps <= 0.0 {
            return Err(InvalidRate(qps));
        }
        Ok(Self::with_rate(qps, burst))
    }

    fn with_rate(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            tokens: f64::from(burst),
            last: Instant::now(),
        }
    }

    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst) - 1.0;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

impl<T> RateLimiter<T> for BucketRateLimiter {
    fn when(&mut self, _item: &T) -> Duration {
        self.reserve()
    }

    fn forget(&mut self, _item: &T) {}

    fn num_requeues(&self, _item: &T) -> u32 {
        0
    }
}

/// Applies the longest delay of all its members.
pub struct MaxOfRateLimiter<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOfRateLimiter<T> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Self {
        Self { limiters }
    }
}

impl<T> RateLimiter<T> for MaxOfRateLimiter<T> {
    fn when(&mut self, item: &T) -> Duration {
        self.limiters
            .iter_mut()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, item: &T) {
        for limiter in &mut self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

/// Per-item exponential backoff combined with an overall 10 qps bucket.
pub fn default_controller_rate_limiter<T>() -> MaxOfRateLimiter<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ExponentialFailureRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )),
        Box::new(BucketRateLimiter::with_rate(DEFAULT_QPS, DEFAULT_BURST)),
    ])
}
