//! # Rate Limiter
//!
//! Token-bucket, sliding-window and fixed-window admission control keyed by
//! `(endpoint scope, principal key)`. Buckets live in a sharded concurrent
//! map; each decision is deterministic given the bucket state and the
//! supplied clock reading, which is what the tests exercise.
//!
//! Buckets idle for more than an hour are evicted by a periodic sweep.
//! Internal inconsistencies (zero-sized windows, algorithm changes under a
//! live bucket) fail open and log a warning.

use crate::common::{HealthStatus, Subsystem};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a bucket may stay untouched before the sweep drops it.
const IDLE_EVICTION: Duration = Duration::from_secs(3600);

/// Admission algorithm for a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitAlgorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

/// How the principal key is derived from request attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    Ip,
    User,
    IpUser,
    IpUserAgent,
}

impl KeyStrategy {
    /// Build the bucket key for a request. Missing attributes degrade to
    /// `"anonymous"` / `"unknown"` rather than failing the request.
    pub fn bucket_key(&self, ip: &str, user: Option<&str>, user_agent: Option<&str>) -> String {
        let user = user.unwrap_or("anonymous");
        match self {
            KeyStrategy::Ip => ip.to_string(),
            KeyStrategy::User => user.to_string(),
            KeyStrategy::IpUser => format!("{ip}:{user}"),
            KeyStrategy::IpUserAgent => {
                let mut hasher = DefaultHasher::new();
                user_agent.unwrap_or("unknown").hash(&mut hasher);
                format!("{ip}:{user}:{:016x}", hasher.finish())
            }
        }
    }
}

/// Per-scope rate-limit parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: RateLimitAlgorithm,
    #[serde(with = "crate::common::duration_serde", default = "default_window")]
    pub window: Duration,
    #[serde(default = "default_max")]
    pub max: u32,
    #[serde(default = "default_key_strategy")]
    pub key_strategy: KeyStrategy,
}

fn default_algorithm() -> RateLimitAlgorithm {
    RateLimitAlgorithm::SlidingWindow
}
fn default_window() -> Duration {
    Duration::from_secs(60)
}
fn default_max() -> u32 {
    100
}
fn default_key_strategy() -> KeyStrategy {
    KeyStrategy::Ip
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            window: default_window(),
            max: default_max(),
            key_strategy: default_key_strategy(),
        }
    }
}

/// Outcome of an admission check, carrying everything the gateway needs for
/// the `X-RateLimit-*` and `Retry-After` headers.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which the bucket resets.
    pub reset_ms: u64,
    /// Seconds a rejected caller should wait before retrying.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn allow(limit: u32, remaining: u32, reset_ms: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_ms,
            retry_after_secs: None,
        }
    }

    fn reject(limit: u32, reset_ms: u64, now_ms: u64) -> Self {
        let retry_after = reset_ms.saturating_sub(now_ms).div_ceil(1000).max(1);
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_ms,
            retry_after_secs: Some(retry_after),
        }
    }
}

#[derive(Debug)]
enum Bucket {
    Fixed { window_start: u64, count: u32 },
    Sliding { hits: VecDeque<u64> },
    Tokens { tokens: f64, last_refill: u64 },
}

#[derive(Debug)]
struct BucketEntry {
    bucket: Bucket,
    last_seen: u64,
}

/// Bucket store keyed by `(scope, principal key)`.
pub struct RateLimiter {
    buckets: DashMap<(String, String), BucketEntry>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Check and consume one unit against the wall clock.
    pub fn check(&self, scope: &str, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        self.check_at(scope, key, config, epoch_millis())
    }

    /// Check and consume one unit at the given instant.
    ///
    /// Decisions are a pure function of `(bucket state, now_ms)`, so tests
    /// drive the clock explicitly.
    pub fn check_at(
        &self,
        scope: &str,
        key: &str,
        config: &RateLimitConfig,
        now_ms: u64,
    ) -> RateLimitDecision {
        let window_ms = config.window.as_millis() as u64;
        if config.max == 0 || window_ms == 0 {
            tracing::warn!(
                scope,
                key,
                "rate limit misconfigured (zero max or window), failing open"
            );
            return RateLimitDecision::allow(config.max, config.max, now_ms + window_ms);
        }

        let mut entry = self
            .buckets
            .entry((scope.to_string(), key.to_string()))
            .or_insert_with(|| BucketEntry {
                bucket: new_bucket(config, now_ms),
                last_seen: now_ms,
            });
        entry.last_seen = now_ms;

        // A changed algorithm under a live bucket restarts it; erring on the
        // permissive side is the documented failure policy.
        if !matches_algorithm(&entry.bucket, config.algorithm) {
            entry.bucket = new_bucket(config, now_ms);
        }

        match &mut entry.bucket {
            Bucket::Fixed { window_start, count } => {
                let current_start = now_ms - (now_ms % window_ms);
                if *window_start != current_start {
                    *window_start = current_start;
                    *count = 0;
                }
                let reset = current_start + window_ms;
                if *count < config.max {
                    *count += 1;
                    RateLimitDecision::allow(config.max, config.max - *count, reset)
                } else {
                    RateLimitDecision::reject(config.max, reset, now_ms)
                }
            }
            Bucket::Sliding { hits } => {
                let horizon = now_ms.saturating_sub(window_ms);
                while hits.front().is_some_and(|&t| t <= horizon) {
                    hits.pop_front();
                }
                if (hits.len() as u32) < config.max {
                    hits.push_back(now_ms);
                    let reset = hits.front().map(|&t| t + window_ms).unwrap_or(now_ms);
                    RateLimitDecision::allow(config.max, config.max - hits.len() as u32, reset)
                } else {
                    let reset = hits.front().map(|&t| t + window_ms).unwrap_or(now_ms);
                    RateLimitDecision::reject(config.max, reset, now_ms)
                }
            }
            Bucket::Tokens { tokens, last_refill } => {
                let rate = f64::from(config.max) / window_ms as f64;
                let elapsed = now_ms.saturating_sub(*last_refill) as f64;
                *tokens = (*tokens + elapsed * rate).min(f64::from(config.max));
                *last_refill = now_ms;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    let until_full = ((f64::from(config.max) - *tokens) / rate).ceil() as u64;
                    RateLimitDecision::allow(config.max, *tokens as u32, now_ms + until_full)
                } else {
                    let until_next = ((1.0 - *tokens) / rate).ceil() as u64;
                    RateLimitDecision::reject(config.max, now_ms + until_next, now_ms)
                }
            }
        }
    }

    /// Evict buckets idle past the eviction horizon; returns the count.
    pub fn sweep_idle(&self, now_ms: u64) -> usize {
        let horizon = now_ms.saturating_sub(IDLE_EVICTION.as_millis() as u64);
        let before = self.buckets.len();
        self.buckets.retain(|_, entry| entry.last_seen > horizon);
        let evicted = before - self.buckets.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.buckets.len(), "evicted idle rate-limit buckets");
        }
        evicted
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Subsystem for RateLimiter {
    fn name(&self) -> &'static str {
        "rate_limiter"
    }

    fn health_status(&self) -> HealthStatus {
        HealthStatus::ok(serde_json::json!({ "buckets": self.bucket_count() }))
    }
}

fn new_bucket(config: &RateLimitConfig, now_ms: u64) -> Bucket {
    let window_ms = config.window.as_millis() as u64;
    match config.algorithm {
        RateLimitAlgorithm::FixedWindow => Bucket::Fixed {
            window_start: now_ms - (now_ms % window_ms.max(1)),
            count: 0,
        },
        RateLimitAlgorithm::SlidingWindow => Bucket::Sliding {
            hits: VecDeque::new(),
        },
        RateLimitAlgorithm::TokenBucket => Bucket::Tokens {
            tokens: f64::from(config.max),
            last_refill: now_ms,
        },
    }
}

fn matches_algorithm(bucket: &Bucket, algorithm: RateLimitAlgorithm) -> bool {
    matches!(
        (bucket, algorithm),
        (Bucket::Fixed { .. }, RateLimitAlgorithm::FixedWindow)
            | (Bucket::Sliding { .. }, RateLimitAlgorithm::SlidingWindow)
            | (Bucket::Tokens { .. }, RateLimitAlgorithm::TokenBucket)
    )
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(algorithm: RateLimitAlgorithm, window: Duration, max: u32) -> RateLimitConfig {
        RateLimitConfig {
            algorithm,
            window,
            max,
            key_strategy: KeyStrategy::Ip,
        }
    }

    #[test]
    fn sliding_window_rejects_the_eleventh_request() {
        let limiter = RateLimiter::new();
        let cfg = config(
            RateLimitAlgorithm::SlidingWindow,
            Duration::from_secs(60),
            10,
        );
        let base = 1_700_000_000_000;

        for i in 0..10 {
            let decision = limiter.check_at("api", "1.2.3.4", &cfg, base + i * 1000);
            assert!(decision.allowed, "request {i} should pass");
        }
        let decision = limiter.check_at("api", "1.2.3.4", &cfg, base + 10_000);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(decision.retry_after_secs.unwrap() >= 1);

        // Once the oldest hit expires, a slot frees up.
        let decision = limiter.check_at("api", "1.2.3.4", &cfg, base + 61_000);
        assert!(decision.allowed);
    }

    #[test]
    fn fixed_window_resets_on_boundary() {
        let limiter = RateLimiter::new();
        let cfg = config(RateLimitAlgorithm::FixedWindow, Duration::from_secs(10), 2);
        let base = 1_700_000_000_000; // multiple of 10s

        assert!(limiter.check_at("api", "k", &cfg, base).allowed);
        assert!(limiter.check_at("api", "k", &cfg, base + 1).allowed);
        let rejected = limiter.check_at("api", "k", &cfg, base + 2);
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_ms, base + 10_000);

        assert!(limiter.check_at("api", "k", &cfg, base + 10_000).allowed);
    }

    #[test]
    fn token_bucket_refills_at_configured_rate() {
        let limiter = RateLimiter::new();
        // 10 tokens per second: one token every 100ms.
        let cfg = config(RateLimitAlgorithm::TokenBucket, Duration::from_secs(1), 10);
        let base = 1_700_000_000_000;

        for i in 0..10 {
            assert!(limiter.check_at("api", "k", &cfg, base + i).allowed);
        }
        assert!(!limiter.check_at("api", "k", &cfg, base + 20).allowed);
        // 100ms later exactly one token has accrued.
        assert!(limiter.check_at("api", "k", &cfg, base + 130).allowed);
        assert!(!limiter.check_at("api", "k", &cfg, base + 131).allowed);
    }

    #[test]
    fn decisions_are_deterministic_for_identical_state_and_clock() {
        let cfg = config(
            RateLimitAlgorithm::SlidingWindow,
            Duration::from_secs(30),
            3,
        );
        let timeline = [0u64, 500, 900, 1_200, 31_000, 31_100];

        let run = || {
            let limiter = RateLimiter::new();
            timeline
                .iter()
                .map(|t| {
                    let d = limiter.check_at("api", "k", &cfg, 1_700_000_000_000 + t);
                    (d.allowed, d.remaining, d.reset_ms)
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = RateLimiter::new();
        let cfg = config(RateLimitAlgorithm::FixedWindow, Duration::from_secs(60), 1);
        let now = 1_700_000_000_000;

        assert!(limiter.check_at("api", "a", &cfg, now).allowed);
        assert!(!limiter.check_at("api", "a", &cfg, now + 1).allowed);
        assert!(limiter.check_at("api", "b", &cfg, now + 2).allowed);
    }

    #[test]
    fn idle_buckets_are_evicted_after_an_hour() {
        let limiter = RateLimiter::new();
        let cfg = RateLimitConfig::default();
        let now = 1_700_000_000_000;

        limiter.check_at("api", "a", &cfg, now);
        limiter.check_at("api", "b", &cfg, now + 30 * 60 * 1000);
        assert_eq!(limiter.bucket_count(), 2);

        let evicted = limiter.sweep_idle(now + 61 * 60 * 1000);
        assert_eq!(evicted, 1);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn misconfigured_limits_fail_open() {
        let limiter = RateLimiter::new();
        let cfg = config(RateLimitAlgorithm::FixedWindow, Duration::from_secs(60), 0);
        assert!(limiter.check_at("api", "k", &cfg, 1_700_000_000_000).allowed);
    }

    #[test]
    fn key_strategies_compose_request_attributes() {
        assert_eq!(KeyStrategy::Ip.bucket_key("1.2.3.4", Some("u"), None), "1.2.3.4");
        assert_eq!(KeyStrategy::User.bucket_key("1.2.3.4", Some("u"), None), "u");
        assert_eq!(
            KeyStrategy::IpUser.bucket_key("1.2.3.4", None, None),
            "1.2.3.4:anonymous"
        );
        let a = KeyStrategy::IpUserAgent.bucket_key("1.2.3.4", Some("u"), Some("curl/8"));
        let b = KeyStrategy::IpUserAgent.bucket_key("1.2.3.4", Some("u"), Some("curl/8"));
        let c = KeyStrategy::IpUserAgent.bucket_key("1.2.3.4", Some("u"), Some("wget/1"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
