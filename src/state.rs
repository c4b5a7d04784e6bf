//! Shared application state threaded through every axum handler.

use crate::pipeline::Pipeline;
use crate::ratelimit::IpRateLimiter;
use crate::stats::GatewayStats;
use crate::kv::KvStore;
use crate::upstream::UpstreamProvider;
use std::sync::Arc;

pub struct AppState<K: KvStore, P: UpstreamProvider> {
    pub pipeline: Arc<Pipeline<K, P>>,
    pub rate_limiter: Arc<IpRateLimiter>,
    pub stats: Arc<GatewayStats>,
    pub admin_token: String,
    pub api_keys: Vec<String>,
    /// Configured tier limits, surfaced on `X-RateLimit-Limit`.
    pub normal_rate_limit: u32,
    pub cached_rate_limit: u32,
}

impl<K: KvStore, P: UpstreamProvider> Clone for AppState<K, P> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            rate_limiter: self.rate_limiter.clone(),
            stats: self.stats.clone(),
            admin_token: self.admin_token.clone(),
            api_keys: self.api_keys.clone(),
            normal_rate_limit: self.normal_rate_limit,
            cached_rate_limit: self.cached_rate_limit,
        }
    }
}

impl<K: KvStore, P: UpstreamProvider> AppState<K, P> {
    pub fn new(
        pipeline: Pipeline<K, P>,
        rate_limiter: Arc<IpRateLimiter>,
        stats: Arc<GatewayStats>,
        admin_token: String,
        api_keys: Vec<String>,
        normal_rate_limit: u32,
        cached_rate_limit: u32,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            rate_limiter,
            stats,
            admin_token,
            api_keys,
            normal_rate_limit,
            cached_rate_limit,
        }
    }
}
