//! Token-bucket rate limiting keyed by identity or source IP.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderValue, header::RETRY_AFTER};
use vidra_config::RateLimitConfig;

const HEADER_RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";
const HEADER_RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RATE_LIMIT_RESET: &str = "x-ratelimit-reset";

/// Snapshot returned for an allowed request.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitSnapshot {
    /// Configured burst.
    pub limit: u32,
    /// Requests remaining in the current window.
    pub remaining: u32,
}

/// Denial details for a throttled request.
#[derive(Clone, Copy, Debug)]
pub struct RateLimitExceeded {
    /// Configured burst.
    pub limit: u32,
    /// Suggested wait before retrying.
    pub retry_after: Duration,
}

/// One token bucket. Tokens are tracked at micro-granularity so fractional
/// replenishment accumulates correctly between checks.
#[derive(Debug)]
struct Bucket {
    tokens: u128,
    last_refill: Instant,
}

const TOKEN_SCALE: u128 = 1_000_000;

impl Bucket {
    fn full(config: &RateLimitConfig) -> Self {
        Self {
            tokens: capacity(config),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed == Duration::ZERO {
            return;
        }
        let period_micros = config.replenish_period().as_micros();
        let cap = capacity(config);
        if period_micros == 0 || cap == 0 {
            self.tokens = cap;
            self.last_refill = now;
            return;
        }
        let replenished = cap.saturating_mul(elapsed.as_micros()) / period_micros;
        if replenished > 0 {
            self.tokens = (self.tokens + replenished).min(cap);
            self.last_refill = now;
        }
    }

    fn evaluate(
        &mut self,
        config: &RateLimitConfig,
        now: Instant,
    ) -> Result<RateLimitSnapshot, RateLimitExceeded> {
        self.refill(config, now);
        if self.tokens >= TOKEN_SCALE {
            self.tokens -= TOKEN_SCALE;
            Ok(RateLimitSnapshot {
                limit: config.burst,
                remaining: u32::try_from(self.tokens / TOKEN_SCALE).unwrap_or(u32::MAX),
            })
        } else {
            let deficit = TOKEN_SCALE - self.tokens;
            let period_micros = config.replenish_period().as_micros();
            let cap = capacity(config).max(1);
            let retry_micros = deficit.saturating_mul(period_micros).div_ceil(cap);
            let retry_after = Duration::from_micros(
                u64::try_from(retry_micros.min(u128::from(u64::MAX))).unwrap_or(u64::MAX),
            );
            Err(RateLimitExceeded {
                limit: config.burst,
                retry_after,
            })
        }
    }
}

fn capacity(config: &RateLimitConfig) -> u128 {
    u128::from(config.burst) * TOKEN_SCALE
}

/// Registry of buckets keyed by caller identity or source address.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one request against the bucket for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when the bucket is empty.
    pub fn check(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitSnapshot, RateLimitExceeded> {
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::full(config));
        bucket.evaluate(config, Instant::now())
    }
}

/// Attach the conventional rate-limit headers to a response.
pub fn insert_rate_limit_headers(
    headers: &mut HeaderMap,
    limit: u32,
    remaining: u32,
    retry_after: Option<Duration>,
) {
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert(HEADER_RATE_LIMIT_LIMIT, value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert(HEADER_RATE_LIMIT_REMAINING, value);
    }
    if let Some(wait) = retry_after {
        let seconds = wait.as_secs().max(1).to_string();
        if let Ok(value) = HeaderValue::from_str(&seconds) {
            headers.insert(RETRY_AFTER, value.clone());
            headers.insert(HEADER_RATE_LIMIT_RESET, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(burst: u32, per_seconds: u64) -> RateLimitConfig {
        RateLimitConfig { burst, per_seconds }
    }

    #[test]
    fn burst_is_honoured_then_throttled() {
        let limiter = RateLimiter::new();
        let cfg = config(3, 3600);

        for _ in 0..3 {
            assert!(limiter.check("caller", &cfg).is_ok());
        }
        let denial = limiter.check("caller", &cfg).expect_err("bucket empty");
        assert_eq!(denial.limit, 3);
        assert!(denial.retry_after > Duration::ZERO);
    }

    #[test]
    fn keys_are_isolated() {
        let limiter = RateLimiter::new();
        let cfg = config(1, 3600);
        assert!(limiter.check("a", &cfg).is_ok());
        assert!(limiter.check("b", &cfg).is_ok());
        assert!(limiter.check("a", &cfg).is_err());
    }

    #[test]
    fn remaining_counts_down() {
        let limiter = RateLimiter::new();
        let cfg = config(5, 3600);
        let first = limiter.check("x", &cfg).unwrap();
        assert_eq!(first.remaining, 4);
        let second = limiter.check("x", &cfg).unwrap();
        assert_eq!(second.remaining, 3);
    }

    #[test]
    fn headers_round_numbers_up() {
        let mut headers = HeaderMap::new();
        insert_rate_limit_headers(
            &mut headers,
            10,
            0,
            Some(Duration::from_millis(200)),
        );
        assert_eq!(headers.get(RETRY_AFTER).unwrap(), "1");
        assert_eq!(headers.get(HEADER_RATE_LIMIT_LIMIT).unwrap(), "10");
    }
}
