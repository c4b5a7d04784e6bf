//! Config read -> dependency construction -> router assembly -> serve.
//! No request-handling logic lives here; see `http` and `pipeline`.

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::accounts::AccountPool;
use crate::breaker::CircuitBreaker;
use crate::cache::CacheEngine;
use crate::coalescer::Coalescer;
use crate::config::Config;
use crate::kv::InMemoryKvStore;
use crate::pipeline::Pipeline;
use crate::ratelimit::{IpRateLimiter, IpRateLimiterConfig};
use crate::state::AppState;
use crate::stats::GatewayStats;
use crate::upstream::{DefaultResponseParser, HttpLyricsProvider, UpstreamFetcher};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub type GatewayState = AppState<InMemoryKvStore, HttpLyricsProvider<DefaultResponseParser>>;

pub async fn run() -> Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    tracing::info!(addr = %config.addr, accounts = config.accounts.len(), "starting lyrics gateway");

    let state = build_state(&config);
    let rate_limiter = state.rate_limiter.clone();
    tokio::spawn(rate_limiter.run_sweep_loop(config.rate_limit_sweep_interval));

    let app = crate::http::build_router(state);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn build_state(config: &Config) -> GatewayState {
    let kv = Arc::new(InMemoryKvStore::new());
    let cache = CacheEngine::new(
        kv,
        config.negative_cache_ttl,
        config.duration_tolerance_seconds,
        config.cache_compression,
    );
    let coalescer = Coalescer::new(config.coalesce_grace);

    let pool = AccountPool::new(config.accounts.clone());
    let breaker = CircuitBreaker::new(
        config.circuit_breaker_threshold,
        config.accounts.len(),
        config.circuit_breaker_cooldown,
        config.circuit_breaker_half_open_timeout,
    );
    let provider = HttpLyricsProvider::new(
        reqwest::Client::new(),
        "https://lyrics-upstream.invalid/getLyrics".to_string(),
        DefaultResponseParser,
    );
    let fetcher = UpstreamFetcher::new(provider, pool, breaker, config.upstream_timeout);

    let stats = Arc::new(GatewayStats::new());
    let pipeline = Pipeline::new(cache, coalescer, fetcher, stats.clone(), config.duration_match_delta_ms);

    let rate_limiter = Arc::new(IpRateLimiter::new(IpRateLimiterConfig {
        normal_rate: config.rate_limit_per_second,
        normal_burst: config.rate_limit_burst,
        cached_rate: config.cached_rate_limit_per_second,
        cached_burst: config.cached_rate_limit_burst,
        idle_reclaim_after: config.rate_limit_sweep_interval * 10,
    }));

    AppState::new(
        pipeline,
        rate_limiter,
        stats,
        config.admin_token.clone(),
        config.api_keys.clone(),
        config.rate_limit_burst,
        config.cached_rate_limit_burst,
    )
}
