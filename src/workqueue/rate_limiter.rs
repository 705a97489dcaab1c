/**
 * Rate limiters: map an item and its failure history to a retry delay
 */
use crate::config::{DEFAULT_BASE_DELAY_MILLIS, DEFAULT_BURST, DEFAULT_MAX_DELAY_SECONDS, DEFAULT_QPS};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

pub trait RateLimiter<T>: Send + Sync {
    /// Delay before `item` should be retried. Counts as one more failure.
    fn when(&self, item: &T) -> Duration;

    /// Stop tracking `item`; the next `when` starts from scratch.
    fn forget(&self, item: &T);

    /// How many times `item` has been requeued since the last `forget`.
    fn num_requeues(&self, item: &T) -> u32;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-item failure counters shared by the limiters below
struct Failures<T> {
    counts: Mutex<HashMap<T, u32>>,
}

impl<T: Eq + Hash + Clone> Failures<T> {
    fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Bump the counter and return the new value
    fn increment(&self, item: &T) -> u32 {
        let mut counts = lock(&self.counts);
        let count = counts.entry(item.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn get(&self, item: &T) -> u32 {
        lock(&self.counts).get(item).copied().unwrap_or(0)
    }

    fn forget(&self, item: &T) {
        lock(&self.counts).remove(item);
    }
}

/// `base * 2^(n-1)` capped at `max`, where `n` counts failures of an item.
pub struct ExponentialBackoff<T> {
    base: Duration,
    max: Duration,
    failures: Failures<T>,
}

impl<T: Eq + Hash + Clone> ExponentialBackoff<T> {
    /// # Errors
    ///
    /// Returns `Error::InvalidRateLimiter` if `max` is zero or `base > max`
    pub fn new(base: Duration, max: Duration) -> Result<Self> {
        if max.is_zero() {
            return Err(Error::InvalidRateLimiter("max delay must be positive".to_string()));
        }
        if base > max {
            return Err(Error::InvalidRateLimiter(format!(
                "base delay {base:?} exceeds max delay {max:?}"
            )));
        }
        Ok(Self::unchecked(base, max))
    }

    fn unchecked(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Failures::new(),
        }
    }
}

impl<T: Eq + Hash + Clone + Send + Sync> RateLimiter<T> for ExponentialBackoff<T> {
    fn when(&self, item: &T) -> Duration {
        let exp = self.failures.increment(item).saturating_sub(1);
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, item: &T) {
        self.failures.forget(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// One token bucket shared by all items.
///
/// The delay only depends on token availability; the per-item counter only
/// feeds `num_requeues`.
pub struct TokenBucket<T> {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
    failures: Failures<T>,
}

impl<T: Eq + Hash + Clone> TokenBucket<T> {
    /// # Errors
    ///
    /// Returns `Error::InvalidRateLimiter` if `qps` is not a positive number or `burst` is zero
    pub fn new(qps: f64, burst: u32) -> Result<Self> {
        if !qps.is_finite() || qps <= 0.0 {
            return Err(Error::InvalidRateLimiter(format!("qps must be positive, got {qps}")));
        }
        if burst == 0 {
            return Err(Error::InvalidRateLimiter("burst must be positive".to_string()));
        }
        Ok(Self::unchecked(qps, burst))
    }

    fn unchecked(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
            failures: Failures::new(),
        }
    }

    /// Take one token, possibly going into debt, and return the wait for it.
    fn reserve(&self) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = elapsed.mul_add(self.qps, bucket.tokens).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }
}

impl<T: Eq + Hash + Clone + Send + Sync> RateLimiter<T> for TokenBucket<T> {
    fn when(&self, item: &T) -> Duration {
        self.failures.increment(item);
        self.reserve()
    }

    fn forget(&self, item: &T) {
        self.failures.forget(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item)
    }
}

/// `fast` delay for the first `max_fast_attempts` failures, `slow` afterwards.
pub struct FastSlow<T> {
    fast: Duration,
    slow: Duration,
    max_fast_attempts: u32,
    failures: Failures<T>,
}

impl<T: Eq + Hash + Clone> FastSlow<T> {
    #[must_use]
    pub fn new(fast: Duration, slow: Duration, max_fast_attempts: u32) -> Self {
        Self {
            fast,
            slow,
            max_fast_attempts,
            failures: Failures::new(),
        }
    }
}

impl<T: Eq + Hash + Clone + Send + Sync> RateLimiter<T> for FastSlow<T> {
    fn when(&self, item: &T) -> Duration {
        if self.failures.increment(item) <= self.max_fast_attempts {
            self.fast
        } else {
            self.slow
        }
    }

    fn forget(&self, item: &T) {
        self.failures.forget(item);
    }

    fn num_requeues(&self, item: &T) -> u32 {
        self.failures.get(item)
    }
}

/// Worst case of several limiters. Every limiter sees every call.
pub struct MaxOf<T> {
    limiters: Vec<Box<dyn RateLimiter<T>>>,
}

impl<T> MaxOf<T> {
    /// # Errors
    ///
    /// Returns `Error::EmptyRateLimiters` if `limiters` is empty
    pub fn new(limiters: Vec<Box<dyn RateLimiter<T>>>) -> Result<Self> {
        if limiters.is_empty() {
            return Err(Error::EmptyRateLimiters);
        }
        Ok(Self { limiters })
    }
}

impl<T> RateLimiter<T> for MaxOf<T> {
    fn when(&self, item: &T) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .fold(Duration::ZERO, Duration::max)
    }

    fn forget(&self, item: &T) {
        for limiter in &self.limiters {
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

/// Per-item exponential backoff from 5ms to 1000s combined with an overall
/// 10 qps / 100 burst token bucket.
#[must_use]
pub fn default_controller_rate_limiter<T>() -> MaxOf<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    MaxOf {
        limiters: vec![
            Box::new(ExponentialBackoff::unchecked(
                Duration::from_millis(DEFAULT_BASE_DELAY_MILLIS),
                Duration::from_secs(DEFAULT_MAX_DELAY_SECONDS),
            )),
            Box::new(TokenBucket::unchecked(DEFAULT_QPS, DEFAULT_BURST)),
        ],
    }
}
