//! Per-IP two-tier token-bucket rate limiter: normal tier, then a faster
//! cache-only fallback tier. Never suspends the caller.

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type DirectLimiter = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

/// `governor::Quota` cannot express a zero-capacity bucket, but the spec
/// requires burst 0 to mean "this tier never admits a request" (see the
/// boundary case for a normal-tier burst of 0). `None` models that tier.
fn bucket(rate_per_sec: u32, burst: u32) -> Option<DirectLimiter> {
    let burst = NonZeroU32::new(burst)?;
    let rate = NonZeroU32::new(rate_per_sec.max(1)).unwrap_or_else(|| unreachable!());
    Some(RateLimiter::direct(Quota::per_second(rate).allow_burst(burst)))
}

/// The outcome of a rate-limit check for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Fresh upstream fetches permitted. `X-RateLimit-Type: normal`.
    Normal,
    /// Cache-only mode: an upstream-requiring path must reject with 429.
    /// `X-RateLimit-Type: cached`.
    CacheOnly,
    /// Both tiers exhausted. 429 immediately.
    Exceeded,
}

struct IpBuckets {
    normal: Option<DirectLimiter>,
    cached: Option<DirectLimiter>,
    last_seen: parking_lot::Mutex<Instant>,
}

impl IpBuckets {
    fn new(normal_rate: u32, normal_burst: u32, cached_rate: u32, cached_burst: u32) -> Self {
        Self {
            normal: bucket(normal_rate, normal_burst),
            cached: bucket(cached_rate, cached_burst),
            last_seen: parking_lot::Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }
}

pub struct IpRateLimiterConfig {
    pub normal_rate: u32,
    pub normal_burst: u32,
    pub cached_rate: u32,
    pub cached_burst: u32,
    pub idle_reclaim_after: Duration,
}

/// Entries are created on demand, per source IP, and reclaimed by an idle
/// sweep; recreation after reclaim is correct (a fresh, full-burst bucket).
pub struct IpRateLimiter {
    entries: DashMap<IpAddr, Arc<IpBuckets>>,
    config: IpRateLimiterConfig,
}

impl IpRateLimiter {
    pub fn new(config: IpRateLimiterConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    fn bucket_for(&self, ip: IpAddr) -> Arc<IpBuckets> {
        self.entries
            .entry(ip)
            .or_insert_with(|| {
                Arc::new(IpBuckets::new(
                    self.config.normal_rate,
                    self.config.normal_burst,
                    self.config.cached_rate,
                    self.config.cached_burst,
                ))
            })
            .clone()
    }

    /// Never blocks. Checks the normal tier first, then the cache-only
    /// fallback tier.
    pub fn check(&self, ip: IpAddr) -> RateLimitDecision {
        let bucket = self.bucket_for(ip);
        bucket.touch();
        if bucket.normal.as_ref().is_some_and(|limiter| limiter.check().is_ok()) {
            RateLimitDecision::Normal
        } else if bucket.cached.as_ref().is_some_and(|limiter| limiter.check().is_ok()) {
            RateLimitDecision::CacheOnly
        } else {
            RateLimitDecision::Exceeded
        }
    }

    /// Drops entries that have not been touched recently. Bounds memory
    /// growth; correctness does not depend on this running.
    pub fn cleanup_idle(&self) -> usize {
        let cutoff = self.config.idle_reclaim_after;
        let before = self.entries.len();
        self.entries
            .retain(|_, bucket| bucket.last_seen.lock().elapsed() < cutoff);
        before - self.entries.len()
    }

    pub async fn run_sweep_loop(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = self.cleanup_idle();
            if removed > 0 {
                tracing::debug!(removed, "rate limiter: swept idle IP entries");
            }
        }
    }
}
