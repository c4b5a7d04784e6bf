//! Lyrics Gateway
//!
//! A caching, rate-limiting, fault-tolerant HTTP gateway in front of one or
//! more upstream lyrics providers. Clients query by (song, artist, optional
//! album, optional duration) and receive timed lyrics (TTML or plain).
//!
//! # Architecture
//!
//! ```text
//! HTTP in -> rate limiter -> key normalization -> cache probe
//!         -> coalescer -> upstream fetcher (account pool x breaker)
//!         -> cache write -> HTTP out
//! ```
//!
//! - [`cache`] — positive/negative cache with duration-tolerant lookup and
//!   stale fallback, backed by the [`kv`] adapter and [`codec`] compression.
//! - [`coalescer`] — singleflight: at most one concurrent upstream fetch per
//!   cache key.
//! - [`ratelimit`] — per-IP two-tier token buckets with cache-only
//!   degradation.
//! - [`accounts`] — round-robin multi-account pool with failover.
//! - [`breaker`] — three-state circuit breaker guarding the upstream.
//! - [`upstream`] — drives the pool and breaker through the retry loop.
//! - [`pipeline`] — composes the above into the ten-step request sequence.
//! - [`http`] — axum router and handlers rendering the header contract.

pub mod accounts;
pub mod app;
pub mod breaker;
pub mod cache;
pub mod coalescer;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod kv;
pub mod pipeline;
pub mod ratelimit;
pub mod stats;
pub mod state;
pub mod upstream;

pub use cache::{CacheEngine, LyricsEntry};
pub use config::Config;
pub use pipeline::{Pipeline, PipelineOutcome};
pub use state::AppState;
