//! Request pipeline: composes cache, coalescer, and upstream fetcher into
//! the ten-step sequence the HTTP handler renders to a response.

use crate::breaker::BreakerState;
use crate::cache::engine::is_permanent_absence;
use crate::cache::{key, CacheEngine, LyricsEntry};
use crate::coalescer::Coalescer;
use crate::kv::KvStore;
use crate::stats::GatewayStats;
use crate::upstream::{LyricsRequest, ProviderResponse, UpstreamErrorKind, UpstreamFetcher, UpstreamProvider};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct LyricsQuery {
    pub song: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_secs: Option<i64>,
}

impl LyricsQuery {
    /// §4.7 step 1: reject only when BOTH song and artist are empty.
    pub fn is_valid(&self) -> bool {
        !(self.song.trim().is_empty() && self.artist.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LyricsBody {
    pub ttml: String,
    pub score: Option<f64>,
}

impl From<LyricsEntry> for LyricsBody {
    fn from(entry: LyricsEntry) -> Self {
        Self {
            ttml: entry.lyrics,
            score: entry.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// 200, `X-Cache-Status: HIT`.
    Hit(LyricsBody),
    /// 200, `X-Cache-Status: STALE` — served from a less-specific key after
    /// a transient upstream failure.
    Stale(LyricsBody),
    /// 404, `X-Cache-Status: NEGATIVE_HIT`.
    NegativeHit(String),
    /// 404, written to the negative cache on this request.
    NotFoundPermanent(String),
    /// 422 — both song and artist were empty.
    BadRequest,
    /// 429, `Retry-After: 60` — cache-only mode, key not cached.
    CacheOnlyMiss,
    /// 500 — transient upstream failure, no stale entry available.
    UpstreamTransient,
}

/// Result of an explicit `/revalidate` refetch: whether the refetched value
/// differs from whatever was cached before the call.
#[derive(Debug, Clone, PartialEq)]
pub struct RevalidateOutcome {
    pub updated: bool,
    pub was_negative_cache: bool,
    pub cache_key: String,
}

pub type FetchOutcome = Result<ProviderResponse, UpstreamErrorKind>;

pub struct Pipeline<K: KvStore, P: UpstreamProvider> {
    cache: CacheEngine<K>,
    coalescer: Coalescer<FetchOutcome>,
    fetcher: UpstreamFetcher<P>,
    stats: Arc<GatewayStats>,
    duration_match_delta_ms: u64,
}

impl<K: KvStore, P: UpstreamProvider> Pipeline<K, P> {
    pub fn new(
        cache: CacheEngine<K>,
        coalescer: Coalescer<FetchOutcome>,
        fetcher: UpstreamFetcher<P>,
        stats: Arc<GatewayStats>,
        duration_match_delta_ms: u64,
    ) -> Self {
        Self {
            cache,
            coalescer,
            fetcher,
            stats,
            duration_match_delta_ms,
        }
    }

    /// Builds the provider-facing request, forwarding the upstream-side
    /// strict duration filter (`DURATION_MATCH_DELTA_MS`) alongside the
    /// cache-side fuzzy duration already carried by `query`.
    fn build_request(&self, query: &LyricsQuery) -> LyricsRequest {
        LyricsRequest {
            song: query.song.clone(),
            artist: query.artist.clone(),
            album: query.album.clone(),
            duration_ms: query.duration_secs.map(|secs| (secs.max(0) as u64) * 1000),
            duration_match_delta_ms: Some(self.duration_match_delta_ms),
        }
    }

    pub async fn health_check(&self) -> anyhow::Result<bool> {
        self.cache.health_check().await
    }

    /// Runs the full sequence. `cache_only` is set by the caller from the
    /// rate limiter's second tier (see `crate::ratelimit`).
    pub async fn handle(&self, query: LyricsQuery, cache_only: bool) -> anyhow::Result<PipelineOutcome> {
        if !query.is_valid() {
            return Ok(PipelineOutcome::BadRequest);
        }

        let key = key::build_key(&query.song, &query.artist, query.album.as_deref(), query.duration_secs);
        let legacy_key = key::build_legacy_key(&query.song, &query.artist, query.album.as_deref());

        // Step 3: probe positive cache, normalized (duration-tolerant) then legacy.
        if let Some((entry, _)) = self
            .cache
            .get_with_duration_tolerance(&query.song, &query.artist, query.album.as_deref(), query.duration_secs)
            .await?
        {
            self.stats.record_cache_hit();
            return Ok(PipelineOutcome::Hit(entry.into()));
        }
        if legacy_key != key {
            if let Some(entry) = self.cache.get_positive(&legacy_key).await? {
                self.stats.record_cache_hit();
                return Ok(PipelineOutcome::Hit(entry.into()));
            }
        }

        // Step 4: probe negative cache, same order.
        if let Some((reason, _)) = self
            .cache
            .get_negative_with_duration_tolerance(&query.song, &query.artist, query.album.as_deref(), query.duration_secs)
            .await?
        {
            self.stats.record_negative_hit();
            return Ok(PipelineOutcome::NegativeHit(reason));
        }
        if legacy_key != key {
            if let Some(reason) = self.cache.get_negative(&legacy_key).await? {
                self.stats.record_negative_hit();
                return Ok(PipelineOutcome::NegativeHit(reason));
            }
        }

        self.stats.record_cache_miss();

        // Step 5: cache-only mode forbids any upstream-requiring path.
        if cache_only {
            return Ok(PipelineOutcome::CacheOnlyMiss);
        }

        // Steps 6-7: coalesce on the normalized key, then call upstream.
        let request = self.build_request(&query);
        self.stats.record_upstream_attempt();
        let breaker_was_open = self.fetcher.breaker().snapshot().state == BreakerState::Open;
        let (fetch_result, is_leader) = self
            .coalescer
            .coalesce(&key, || async { self.fetcher.fetch(&request).await })
            .await;

        if !is_leader {
            self.stats.record_coalesced_wait();
        } else if !breaker_was_open && self.fetcher.breaker().snapshot().state == BreakerState::Open {
            self.stats.record_breaker_trip();
        }

        match fetch_result {
            Ok(response) => {
                let entry = LyricsEntry::new(response.lyrics.clone(), response.track_duration_ms, response.score);
                self.cache.set_positive(&key, &entry).await?;
                Ok(PipelineOutcome::Hit(entry.into()))
            }
            Err(err) => {
                self.stats.record_upstream_failure();
                self.handle_upstream_failure(&query, err).await
            }
        }
    }

    /// `/revalidate`: unlike `handle`, never probes the positive/negative
    /// cache first — always reaches the upstream (through the coalescer, so
    /// a concurrent `/getLyrics` for the same key still shares the fetch)
    /// and compares the result against whatever was cached before the call.
    pub async fn revalidate(&self, query: &LyricsQuery) -> anyhow::Result<RevalidateOutcome> {
        let key = key::build_key(&query.song, &query.artist, query.album.as_deref(), query.duration_secs);

        let previous_positive = self.cache.get_positive(&key).await?;
        let was_negative_cache = self.cache.get_negative(&key).await?.is_some();

        let request = self.build_request(query);
        self.stats.record_upstream_attempt();
        let (fetch_result, _) = self
            .coalescer
            .coalesce(&key, || async { self.fetcher.fetch(&request).await })
            .await;

        let updated = match fetch_result {
            Ok(response) => {
                let entry = LyricsEntry::new(response.lyrics.clone(), response.track_duration_ms, response.score);
                let changed = match &previous_positive {
                    Some(previous) => previous.lyrics != entry.lyrics,
                    None => true,
                };
                self.cache.set_positive(&key, &entry).await?;
                changed
            }
            Err(err) => {
                self.stats.record_upstream_failure();
                if let UpstreamErrorKind::Failed(message) = &err {
                    if is_permanent_absence(message) {
                        self.cache.set_negative(&key, message).await?;
                    }
                }
                false
            }
        };

        Ok(RevalidateOutcome {
            updated,
            was_negative_cache,
            cache_key: key,
        })
    }

    async fn handle_upstream_failure(
        &self,
        query: &LyricsQuery,
        err: UpstreamErrorKind,
    ) -> anyhow::Result<PipelineOutcome> {
        let message = match &err {
            UpstreamErrorKind::Unavailable => "upstream unavailable".to_string(),
            UpstreamErrorKind::AllAccountsFailed => "all accounts failed".to_string(),
            UpstreamErrorKind::Failed(message) => message.clone(),
        };

        // Open question resolved: stale fallback is triggered only for
        // non-permanent errors, never for a definitive "no track" answer.
        let is_permanent = matches!(&err, UpstreamErrorKind::Failed(m) if is_permanent_absence(m));

        if is_permanent {
            let key = key::build_key(&query.song, &query.artist, query.album.as_deref(), query.duration_secs);
            self.cache.set_negative(&key, &message).await?;
            return Ok(PipelineOutcome::NotFoundPermanent(message));
        }

        debug!(error = %message, "upstream failure, attempting stale fallback");
        if query.album.is_some() {
            if let Some((entry, _)) = self
                .cache
                .get_stale_fallback(&query.song, &query.artist, query.duration_secs)
                .await?
            {
                self.stats.record_stale_serve();
                return Ok(PipelineOutcome::Stale(entry.into()));
            }
        }

        Ok(PipelineOutcome::UpstreamTransient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{Account, AccountPool};
    use crate::breaker::CircuitBreaker;
    use crate::kv::InMemoryKvStore;
    use crate::upstream::ProviderError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedProvider {
        calls: AtomicUsize,
        response: FetchOutcome,
    }

    #[async_trait]
    impl UpstreamProvider for ScriptedProvider {
        async fn fetch(
            &self,
            _request: &LyricsRequest,
            _account: &Account,
        ) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(response) => Ok(response.clone()),
                Err(UpstreamErrorKind::Failed(message)) => Err(ProviderError::Other(message.clone())),
                Err(_) => Err(ProviderError::Other("upstream unavailable".to_string())),
            }
        }
    }

    fn pipeline_with(
        response: FetchOutcome,
    ) -> Pipeline<InMemoryKvStore, ScriptedProvider> {
        let cache = CacheEngine::new(
            Arc::new(InMemoryKvStore::new()),
            Duration::from_secs(7 * 86_400),
            2,
            false,
        );
        let coalescer = Coalescer::new(Duration::from_millis(50));
        let provider = ScriptedProvider {
            calls: AtomicUsize::new(0),
            response,
        };
        let pool = AccountPool::new(vec![Account {
            name: "a1".to_string(),
            bearer_token: "t".to_string(),
            media_user_token: "m".to_string(),
        }]);
        let breaker = CircuitBreaker::new(5, 1, Duration::from_secs(30), Duration::from_secs(10));
        let fetcher = UpstreamFetcher::new(provider, pool, breaker, Duration::from_secs(1));
        Pipeline::new(cache, coalescer, fetcher, Arc::new(GatewayStats::new()), 2000)
    }

    fn query() -> LyricsQuery {
        LyricsQuery {
            song: "Shape Of You".to_string(),
            artist: "Ed Sheeran".to_string(),
            album: Some("Divide".to_string()),
            duration_secs: Some(234),
        }
    }

    #[tokio::test]
    async fn both_empty_song_and_artist_is_bad_request() {
        let pipeline = pipeline_with(Ok(ProviderResponse {
            lyrics: "x".to_string(),
            track_duration_ms: 1,
            score: 1.0,
            language: None,
            is_rtl: None,
        }));
        let outcome = pipeline
            .handle(
                LyricsQuery {
                    song: "  ".to_string(),
                    artist: "".to_string(),
                    album: None,
                    duration_secs: None,
                },
                false,
            )
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(outcome, PipelineOutcome::BadRequest);
    }

    #[tokio::test]
    async fn warm_cache_hit_skips_upstream() {
        let pipeline = pipeline_with(Ok(ProviderResponse {
            lyrics: "fresh".to_string(),
            track_duration_ms: 1,
            score: 1.0,
            language: None,
            is_rtl: None,
        }));
        let key = key::build_key("Shape Of You", "Ed Sheeran", Some("Divide"), Some(234));
        pipeline
            .cache
            .set_positive(&key, &LyricsEntry::new("L", 234_000, 1.0))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let outcome = pipeline.handle(query(), false).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(outcome, PipelineOutcome::Hit(LyricsBody { ttml: "L".to_string(), score: Some(1.0) }));
    }

    #[tokio::test]
    async fn negative_cache_hit_returns_without_upstream_call() {
        let pipeline = pipeline_with(Ok(ProviderResponse {
            lyrics: "x".to_string(),
            track_duration_ms: 1,
            score: 1.0,
            language: None,
            is_rtl: None,
        }));
        let key = key::build_key("unknown song", "unknown artist", None, None);
        pipeline
            .cache
            .set_negative(&key, "no track found")
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let outcome = pipeline
            .handle(
                LyricsQuery {
                    song: "unknown song".to_string(),
                    artist: "unknown artist".to_string(),
                    album: None,
                    duration_secs: None,
                },
                false,
            )
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(outcome, PipelineOutcome::NegativeHit("no track found".to_string()));
        assert_eq!(pipeline.fetcher.breaker().snapshot().failures, 0);
    }

    #[tokio::test]
    async fn cache_only_mode_rejects_miss_without_upstream_call() {
        let pipeline = pipeline_with(Ok(ProviderResponse {
            lyrics: "x".to_string(),
            track_duration_ms: 1,
            score: 1.0,
            language: None,
            is_rtl: None,
        }));
        let outcome = pipeline.handle(query(), true).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(outcome, PipelineOutcome::CacheOnlyMiss);
    }

    #[tokio::test]
    async fn permanent_absence_writes_negative_entry_and_returns_404() {
        let pipeline = pipeline_with(Err(UpstreamErrorKind::Failed("no track found".to_string())));
        let outcome = pipeline.handle(query(), false).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(outcome, PipelineOutcome::NotFoundPermanent("no track found".to_string()));

        let key = key::build_key("Shape Of You", "Ed Sheeran", Some("Divide"), Some(234));
        assert_eq!(
            pipeline.cache.get_negative(&key).await.unwrap_or_else(|e| panic!("{e}")),
            Some("no track found".to_string())
        );
    }

    #[tokio::test]
    async fn transient_failure_falls_back_to_stale_no_album_entry() {
        let pipeline = pipeline_with(Err(UpstreamErrorKind::Failed("connection reset".to_string())));
        let stale_key = key::build_key("Shape Of You", "Ed Sheeran", None, Some(234));
        pipeline
            .cache
            .set_positive(&stale_key, &LyricsEntry::new("old lyrics", 234_000, 0.5))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let outcome = pipeline.handle(query(), false).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(
            outcome,
            PipelineOutcome::Stale(LyricsBody { ttml: "old lyrics".to_string(), score: Some(0.5) })
        );
    }

    #[tokio::test]
    async fn transient_failure_without_stale_entry_returns_500() {
        let pipeline = pipeline_with(Err(UpstreamErrorKind::Failed("connection reset".to_string())));
        let outcome = pipeline.handle(query(), false).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(outcome, PipelineOutcome::UpstreamTransient);
    }

    #[tokio::test]
    async fn revalidate_refetches_even_when_already_cached() {
        let pipeline = pipeline_with(Ok(ProviderResponse {
            lyrics: "updated lyrics".to_string(),
            track_duration_ms: 234_000,
            score: 0.9,
            language: None,
            is_rtl: None,
        }));
        let key = key::build_key("Shape Of You", "Ed Sheeran", Some("Divide"), Some(234));
        pipeline
            .cache
            .set_positive(&key, &LyricsEntry::new("stale lyrics", 234_000, 0.5))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let outcome = pipeline.revalidate(&query()).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(outcome.updated);
        assert!(!outcome.was_negative_cache);

        let refreshed = pipeline.cache.get_positive(&key).await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(refreshed.map(|e| e.lyrics), Some("updated lyrics".to_string()));
    }

    #[tokio::test]
    async fn revalidate_reports_unchanged_when_refetch_matches_cache() {
        let pipeline = pipeline_with(Ok(ProviderResponse {
            lyrics: "same lyrics".to_string(),
            track_duration_ms: 234_000,
            score: 0.9,
            language: None,
            is_rtl: None,
        }));
        let key = key::build_key("Shape Of You", "Ed Sheeran", Some("Divide"), Some(234));
        pipeline
            .cache
            .set_positive(&key, &LyricsEntry::new("same lyrics", 234_000, 0.9))
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let outcome = pipeline.revalidate(&query()).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(!outcome.updated);
    }

    #[tokio::test]
    async fn revalidate_against_uncached_key_reports_updated() {
        let pipeline = pipeline_with(Ok(ProviderResponse {
            lyrics: "first fetch".to_string(),
            track_duration_ms: 234_000,
            score: 0.9,
            language: None,
            is_rtl: None,
        }));
        let outcome = pipeline.revalidate(&query()).await.unwrap_or_else(|e| panic!("{e}"));
        assert!(outcome.updated);
        assert!(!outcome.was_negative_cache);
    }
}
