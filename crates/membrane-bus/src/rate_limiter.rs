//! Per-(tenant, channel) token bucket rate limiting.
//!
//! Buckets start full. Every check refills `min(capacity, tokens + elapsed * rate)`
//! and advances `last_refill`, whether or not the check is allowed; a token
//! is only withdrawn when at least one whole token is available.

use dashmap::DashMap;
use membrane_types::RateLimited;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default bucket capacity.
pub const DEFAULT_CAPACITY: u32 = 100;

/// Default refill window. Capacity refills fully over one window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Bucket sizing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            window: DEFAULT_WINDOW,
        }
    }
}

impl RateLimitConfig {
    /// Tokens per second.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs > 0.0 {
            f64::from(self.capacity) / secs
        } else {
            f64::from(self.capacity)
        }
    }
}

/// Bucket key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub tenant: String,
    pub channel: String,
}

impl BucketKey {
    pub fn new(tenant: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            channel: channel.into(),
        }
    }
}

/// One bucket.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, capacity: f64, rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = capacity.min(self.tokens + elapsed.as_secs_f64() * rate);
        // Never move backwards if callers pass out-of-order instants.
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn try_take(&mut self, capacity: f64, rate: f64, now: Instant) -> bool {
        self.refill(capacity, rate, now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn projected(&self, capacity: f64, rate: f64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        capacity.min(self.tokens + elapsed.as_secs_f64() * rate)
    }
}

/// Sharded rate limiter. Checks on one key serialize on that key's shard;
/// different keys proceed in parallel.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<BucketKey, TokenBucket>,
    config: RateLimitConfig,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Check and withdraw one token now.
    ///
    /// # Errors
    ///
    /// [`RateLimited`] when the bucket holds less than one token.
    pub fn allow(&self, tenant: &str, channel: &str) -> Result<(), RateLimited> {
        if self.check_at(&BucketKey::new(tenant, channel), Instant::now()) {
            Ok(())
        } else {
            warn!(tenant, channel, "Rate limit exceeded");
            Err(RateLimited {
                tenant: tenant.to_string(),
                channel: channel.to_string(),
            })
        }
    }

    /// Check and withdraw one token at `now`.
    pub fn check_at(&self, key: &BucketKey, now: Instant) -> bool {
        let capacity = f64::from(self.config.capacity);
        let rate = self.config.refill_rate();
        let mut bucket = self.buckets.entry(key.clone()).or_insert_with(|| {
            debug!(tenant = %key.tenant, channel = %key.channel, "Creating new rate limit bucket");
            TokenBucket::full(capacity, now)
        });
        bucket.try_take(capacity, rate, now)
    }

    /// Tokens the bucket would hold at `now`, without touching it. Unknown
    /// keys report a full bucket.
    #[must_use]
    pub fn available_at(&self, key: &BucketKey, now: Instant) -> f64 {
        let capacity = f64::from(self.config.capacity);
        self.buckets
            .get(key)
            .map(|b| b.projected(capacity, self.config.refill_rate(), now))
            .unwrap_or(capacity)
    }

    /// Drop buckets idle for longer than `max_idle`. An idle bucket has
    /// refilled completely, so dropping it loses nothing.
    pub fn cleanup(&self, max_idle: Duration) -> usize {
        self.cleanup_at(max_idle, Instant::now())
    }

    /// [`RateLimiter::cleanup`] as seen at `now`.
    pub fn cleanup_at(&self, max_idle: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= max_idle);
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, "Removed idle rate limit buckets");
        }
        removed
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
