//! Per-key token-bucket rate limiting.
//!
//! Every key (usually a chat / peer id) owns one [`Bucket`] that refills
//! continuously at `rate` tokens per second up to `capacity`. Buckets are
//! created lazily on first use, start full, and are each guarded by their own
//! lock so a noisy chat never serializes unrelated ones.
//!
//! ```rust,ignore
//! let limiter = RateLimiter::new(LimitConfig::new(20.0, 3.0), LimitMode::Block);
//!
//! // Waits if peer 42 already spent its burst.
//! let waited = limiter.acquire(42, 1.0).await?;
//!
//! // Wraps an outbound call.
//! let msg_id = limiter.call(42, 1.0, || bot.send_message(42, "hi")).await??;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::RateLimitError;

/// What `acquire` does when a bucket is short of tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitMode {
    /// Suspend the caller until enough tokens have accrued.
    #[default]
    Block,
    /// Fail immediately with [`RateLimitError::Rejected`].
    Reject,
}

/// Refill rate and burst size of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Tokens added per second.
    pub rate: f64,
    /// Maximum number of tokens a bucket can hold.
    pub capacity: f64,
}

impl LimitConfig {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self { rate, capacity }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        // Typical bot API allowance: 20 calls/s with a small burst.
        Self {
            rate: 20.0,
            capacity: 20.0,
        }
    }
}

// ============================================================================
// Bucket
// ============================================================================

/// Token state of a single key.
#[derive(Debug, Clone)]
pub struct Bucket {
    tokens: f64,
    last_refill: Instant,
    rate: f64,
    capacity: f64,
}

impl Bucket {
    /// Creates a full bucket.
    pub fn new(config: LimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
            rate: config.rate,
            capacity: config.capacity,
        }
    }

    /// Adds the tokens accrued since the last refill, clamped to capacity.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Consumes `cost` tokens if available.
    ///
    /// On shortage nothing is consumed and the time until `cost` tokens will
    /// be available is returned.
    pub fn try_consume(&mut self, cost: f64, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            Err(self.deficit_wait(cost))
        }
    }

    /// Time until `cost` tokens are available, without consuming.
    pub fn wait_time(&mut self, cost: f64, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= cost {
            Duration::ZERO
        } else {
            self.deficit_wait(cost)
        }
    }

    fn deficit_wait(&self, cost: f64) -> Duration {
        if self.rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((cost - self.tokens) / self.rate)
    }

    /// Tokens currently available (after refill).
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Returns `true` if the bucket is full, i.e. indistinguishable from a
    /// freshly created one.
    fn is_full(&mut self, now: Instant) -> bool {
        self.available(now) >= self.capacity
    }
}

// ============================================================================
// RateLimiter
// ============================================================================

struct LimiterInner {
    buckets: DashMap<String, Arc<Mutex<Bucket>>>,
    overrides: DashMap<String, LimitConfig>,
    default: LimitConfig,
    mode: LimitMode,
}

/// A keyed collection of token buckets.
///
/// Cheap to clone; clones share the same buckets.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

impl RateLimiter {
    /// Creates a limiter where every key gets `default` unless overridden.
    pub fn new(default: LimitConfig, mode: LimitMode) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                buckets: DashMap::new(),
                overrides: DashMap::new(),
                default,
                mode,
            }),
        }
    }

    pub fn mode(&self) -> LimitMode {
        self.inner.mode
    }

    pub fn default_limit(&self) -> LimitConfig {
        self.inner.default
    }

    /// Sets a dedicated limit for `key`, replacing its current bucket.
    pub fn set_limit(&self, key: impl Display, config: LimitConfig) {
        let key = key.to_string();
        self.inner.buckets.remove(&key);
        self.inner.overrides.insert(key, config);
    }

    /// Forgets the bucket (and override) of `key`.
    pub fn remove(&self, key: impl Display) {
        let key = key.to_string();
        self.inner.buckets.remove(&key);
        self.inner.overrides.remove(&key);
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.inner.buckets.len()
    }

    /// Evicts buckets that have refilled completely.
    ///
    /// A full bucket behaves exactly like a fresh one, so eviction is
    /// invisible to callers. Buckets a caller is still holding are kept, so a
    /// key never has two live buckets. Call periodically to bound memory.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.inner.buckets.len();
        self.inner.buckets.retain(|_, bucket| {
            Arc::strong_count(bucket) > 1 || !bucket.lock().is_full(now)
        });
        let evicted = before.saturating_sub(self.inner.buckets.len());
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate-limit buckets");
        }
        evicted
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.inner.buckets.get(key) {
            return Arc::clone(bucket.value());
        }
        let config = self
            .inner
            .overrides
            .get(key)
            .map(|c| *c.value())
            .unwrap_or(self.inner.default);
        let entry = self
            .inner
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Bucket::new(config, Instant::now()))));
        Arc::clone(entry.value())
    }

    fn validate(&self, key: &str, cost: f64, bucket: &Mutex<Bucket>) -> Result<(), RateLimitError> {
        if !cost.is_finite() || cost < 0.0 {
            return Err(RateLimitError::InvalidCost(cost));
        }
        let capacity = bucket.lock().capacity();
        if cost > capacity {
            return Err(RateLimitError::CostExceedsCapacity {
                key: key.to_string(),
                cost,
                capacity,
            });
        }
        Ok(())
    }

    /// Takes `cost` tokens from `key`'s bucket without ever waiting.
    pub fn try_acquire(&self, key: impl Display, cost: f64) -> Result<(), RateLimitError> {
        if cost == 0.0 {
            return Ok(());
        }
        let key = key.to_string();
        let bucket = self.bucket(&key);
        self.validate(&key, cost, &bucket)?;

        let result = bucket.lock().try_consume(cost, Instant::now());
        result.map_err(|retry_after| {
            trace!(key = %key, ?retry_after, "Rate limit exceeded");
            RateLimitError::Rejected { key, retry_after }
        })
    }

    /// Takes `cost` tokens from `key`'s bucket.
    ///
    /// Returns how long the caller had to wait (`Duration::ZERO` when tokens
    /// were available). In [`LimitMode::Reject`] a shortage fails with
    /// [`RateLimitError::Rejected`] instead of waiting. A zero cost never
    /// touches the bucket.
    pub async fn acquire(&self, key: impl Display, cost: f64) -> Result<Duration, RateLimitError> {
        if cost == 0.0 {
            return Ok(Duration::ZERO);
        }
        let key = key.to_string();
        let bucket = self.bucket(&key);
        self.validate(&key, cost, &bucket)?;

        let mut waited = Duration::ZERO;
        loop {
            // Lock is released before sleeping.
            let attempt = bucket.lock().try_consume(cost, Instant::now());
            match attempt {
                Ok(()) => {
                    if !waited.is_zero() {
                        debug!(key = %key, ?waited, "Rate limit wait finished");
                    }
                    return Ok(waited);
                }
                Err(retry_after) => {
                    if self.inner.mode == LimitMode::Reject {
                        trace!(key = %key, ?retry_after, "Rate limit exceeded");
                        return Err(RateLimitError::Rejected { key, retry_after });
                    }
                    trace!(key = %key, ?retry_after, "Waiting for rate-limit tokens");
                    tokio::time::sleep(retry_after).await;
                    waited += retry_after;
                }
            }
        }
    }

    /// Time until `cost` tokens would be available for `key`.
    pub fn wait_time(&self, key: impl Display, cost: f64) -> Duration {
        let key = key.to_string();
        match self.inner.buckets.get(&key) {
            Some(bucket) => bucket.lock().wait_time(cost, Instant::now()),
            None => {
                let config = self
                    .inner
                    .overrides
                    .get(&key)
                    .map(|c| *c.value())
                    .unwrap_or(self.inner.default);
                Bucket::new(config, Instant::now()).wait_time(cost, Instant::now())
            }
        }
    }

    /// Tokens currently available for `key`.
    pub fn available(&self, key: impl Display) -> f64 {
        let key = key.to_string();
        match self.inner.buckets.get(&key) {
            Some(bucket) => bucket.lock().available(Instant::now()),
            None => self
                .inner
                .overrides
                .get(&key)
                .map(|c| c.capacity)
                .unwrap_or(self.inner.default.capacity),
        }
    }

    /// Runs `action` once `cost` tokens have been taken from `key`.
    ///
    /// This is the gate every outbound platform call should go through.
    pub async fn call<F, Fut, T>(
        &self,
        key: impl Display,
        cost: f64,
        action: F,
    ) -> Result<T, RateLimitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(key, cost).await?;
        Ok(action().await)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(LimitConfig::default(), LimitMode::default())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("default", &self.inner.default)
            .field("mode", &self.inner.mode)
            .field("buckets", &self.inner.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn five_per_second(mode: LimitMode) -> RateLimiter {
        RateLimiter::new(LimitConfig::new(1.0, 5.0), mode)
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_then_wait_about_one_second() {
        let limiter = five_per_second(LimitMode::Block);
        for _ in 0..5 {
            assert_eq!(limiter.acquire("chat", 1.0).await, Ok(Duration::ZERO));
        }

        let started = Instant::now();
        let waited = assert_ok!(limiter.acquire("chat", 1.0).await);
        let secs = waited.as_secs_f64();
        assert!((secs - 1.0).abs() < 0.01, "waited {secs}s");
        assert!(started.elapsed() >= Duration::from_millis(990));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_then_reject() {
        let limiter = five_per_second(LimitMode::Reject);
        for _ in 0..5 {
            assert_ok!(limiter.acquire("chat", 1.0).await);
        }
        match limiter.acquire("chat", 1.0).await {
            Err(RateLimitError::Rejected { key, retry_after }) => {
                assert_eq!(key, "chat");
                assert!((retry_after.as_secs_f64() - 1.0).abs() < 0.01);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cost_never_changes_state() {
        let limiter = five_per_second(LimitMode::Reject);
        assert_ok!(limiter.acquire("chat", 0.0).await);
        assert_eq!(limiter.bucket_count(), 0);

        assert_ok!(limiter.try_acquire("chat", 2.0));
        let before = limiter.available("chat");
        assert_ok!(limiter.try_acquire("chat", 0.0));
        assert_eq!(limiter.available("chat"), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_isolated() {
        let limiter = five_per_second(LimitMode::Reject);
        for _ in 0..5 {
            assert_ok!(limiter.try_acquire(1, 1.0));
        }
        assert_err!(limiter.try_acquire(1, 1.0));
        assert_ok!(limiter.try_acquire(2, 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_clamped_to_capacity() {
        let limiter = five_per_second(LimitMode::Reject);
        assert_ok!(limiter.try_acquire("chat", 3.0));
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(limiter.available("chat"), 5.0);
        for _ in 0..5 {
            assert_ok!(limiter.try_acquire("chat", 1.0));
        }
        assert_err!(limiter.try_acquire("chat", 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_refill() {
        let limiter = five_per_second(LimitMode::Reject);
        assert_ok!(limiter.try_acquire("chat", 5.0));
        tokio::time::advance(Duration::from_millis(2500)).await;
        let available = limiter.available("chat");
        assert!((available - 2.5).abs() < 1e-9);
        let wait = limiter.wait_time("chat", 3.0);
        assert!((wait.as_secs_f64() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_costs() {
        let limiter = five_per_second(LimitMode::Reject);
        assert!(matches!(
            limiter.try_acquire("chat", 6.0),
            Err(RateLimitError::CostExceedsCapacity { .. })
        ));
        assert!(matches!(
            limiter.try_acquire("chat", -1.0),
            Err(RateLimitError::InvalidCost(_))
        ));
        assert!(matches!(
            limiter.try_acquire("chat", f64::NAN),
            Err(RateLimitError::InvalidCost(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrides_and_cleanup() {
        let limiter = five_per_second(LimitMode::Reject);
        limiter.set_limit("vip", LimitConfig::new(1.0, 1.0));
        assert_ok!(limiter.try_acquire("vip", 1.0));
        assert_err!(limiter.try_acquire("vip", 1.0));

        assert_ok!(limiter.try_acquire("other", 1.0));
        assert_eq!(limiter.bucket_count(), 2);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.cleanup(), 2);
        assert_eq!(limiter.bucket_count(), 0);

        // the override survives eviction
        assert_ok!(limiter.try_acquire("vip", 1.0));
        assert_err!(limiter.try_acquire("vip", 1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_keeps_held_bucket() {
        let limiter = five_per_second(LimitMode::Reject);
        let held = limiter.bucket("chat");
        assert_eq!(limiter.cleanup(), 0);
        assert_eq!(limiter.bucket_count(), 1);

        assert!(held.lock().try_consume(1.0, Instant::now()).is_ok());
        let mut granted = 1;
        while limiter.try_acquire("chat", 1.0).is_ok() {
            granted += 1;
        }
        assert_eq!(granted, 5);

        drop(held);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.cleanup(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_gates_action() {
        let limiter = RateLimiter::new(LimitConfig::new(1.0, 1.0), LimitMode::Reject);
        let first = limiter.call(9, 1.0, || async { 42 }).await;
        assert_eq!(first, Ok(42));
        let second = limiter.call(9, 1.0, || async { 43 }).await;
        assert!(matches!(second, Err(RateLimitError::Rejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waiters_never_overdraw() {
        let limiter = RateLimiter::new(LimitConfig::new(10.0, 2.0), LimitMode::Block);
        let mut tasks = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            tasks.push(tokio::spawn(async move { limiter.acquire("k", 1.0).await }));
        }
        for task in tasks {
            assert_ok!(task.await.unwrap());
        }
        let available = limiter.available("k");
        assert!((0.0..=2.0).contains(&available));
    }
}
