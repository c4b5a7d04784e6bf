//! Upstream fetcher: drives the account pool and circuit breaker through
//! the per-attempt retry loop, classifying errors for the caller.

use crate::accounts::{Account, AccountPool};
use crate::breaker::CircuitBreaker;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LyricsRequest {
    pub song: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_ms: Option<u64>,
    /// `DURATION_MATCH_DELTA_MS` — the upstream-side strict filter window;
    /// forwarded verbatim so the provider can reject tracks whose duration
    /// doesn't fall within this many milliseconds of `duration_ms`.
    pub duration_match_delta_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub lyrics: String,
    pub track_duration_ms: u64,
    pub score: f64,
    pub language: Option<String>,
    pub is_rtl: Option<bool>,
}

/// What a single provider call can fail with. `Auth`/`RateLimited` are
/// credential-local and trigger a retry with the next account; `Other`
/// carries the upstream's own message, classified downstream (see
/// `crate::cache::engine::is_permanent_absence`) as either a 404-worthy
/// permanent absence or a transient failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderError {
    Auth,
    RateLimited,
    Other(String),
}

/// The contract named in scope: "fetch lyrics for (song, artist, album,
/// durationMs) -> (lyrics, trackDurationMs, score, error-kind)". Concrete
/// wire formats are an external collaborator's concern.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    async fn fetch(
        &self,
        request: &LyricsRequest,
        account: &Account,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Errors surfaced by [`UpstreamFetcher::fetch`] to its caller (the
/// pipeline). `Unavailable` is never cacheable; `Failed` carries the raw
/// upstream message for classification.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamErrorKind {
    /// Breaker open, or the account pool is empty.
    Unavailable,
    /// Every attempted account was skipped (auth/rate-limit) without any
    /// attempt returning a non-credential error.
    AllAccountsFailed,
    /// A non-credential error from the upstream; `String` is its message.
    Failed(String),
}

pub struct UpstreamFetcher<P: UpstreamProvider> {
    provider: P,
    pool: AccountPool,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl<P: UpstreamProvider> UpstreamFetcher<P> {
    pub fn new(provider: P, pool: AccountPool, breaker: CircuitBreaker, timeout: Duration) -> Self {
        Self {
            provider,
            pool,
            breaker,
            timeout,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn fetch(
        &self,
        request: &LyricsRequest,
    ) -> Result<ProviderResponse, UpstreamErrorKind> {
        if !self.breaker.allow() {
            debug!("upstream fetcher: breaker disallows request");
            return Err(UpstreamErrorKind::Unavailable);
        }

        let attempts = 3.min(self.pool.len());
        for _ in 0..attempts {
            let Some((account, idx)) = self.pool.select_next() else {
                break;
            };

            let outcome = tokio::time::timeout(self.timeout, self.provider.fetch(request, &account)).await;
            let result = match outcome {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Other("upstream request timed out".to_string())),
            };

            match result {
                Ok(response) => {
                    self.breaker.record_success();
                    return Ok(response);
                }
                Err(ProviderError::Auth | ProviderError::RateLimited) => {
                    warn!(account = %account.name, "upstream fetcher: credential-local failure, skipping account");
                    self.pool.skip(idx);
                }
                Err(ProviderError::Other(message)) => {
                    self.breaker.record_failure();
                    return Err(UpstreamErrorKind::Failed(message));
                }
            }
        }

        self.breaker.record_failure();
        if self.pool.is_empty() {
            Err(UpstreamErrorKind::Unavailable)
        } else {
            Err(UpstreamErrorKind::AllAccountsFailed)
        }
    }
}

/// HTTP-based implementation of [`UpstreamProvider`]. The JSON body shape
/// is delegated to a [`ResponseParser`] so the wire contract can vary by
/// deployment without touching retry/breaker logic.
pub trait ResponseParser: Send + Sync {
    fn parse(&self, body: &serde_json::Value) -> Result<ProviderResponse, ProviderError>;
}

/// Default wire contract: a 200 body shaped `{ "lyrics": string,
/// "trackDurationMs": number, "score": number, "language"?: string,
/// "isRTL"?: bool }`, or `{ "error": string }` for a definitive "no track"
/// answer delivered with a 200 status. Deployments with a different
/// upstream JSON shape supply their own [`ResponseParser`].
#[derive(Debug, Clone, Default)]
pub struct DefaultResponseParser;

impl ResponseParser for DefaultResponseParser {
    fn parse(&self, body: &serde_json::Value) -> Result<ProviderResponse, ProviderError> {
        if let Some(error) = body.get("error").and_then(serde_json::Value::as_str) {
            return Err(ProviderError::Other(error.to_string()));
        }

        let lyrics = body
            .get("lyrics")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        if lyrics.is_empty() {
            return Err(ProviderError::Other("TTML content is empty".to_string()));
        }

        Ok(ProviderResponse {
            lyrics,
            track_duration_ms: body
                .get("trackDurationMs")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0),
            score: body
                .get("score")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0),
            language: body
                .get("language")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            is_rtl: body.get("isRTL").and_then(serde_json::Value::as_bool),
        })
    }
}

pub struct HttpLyricsProvider<R: ResponseParser> {
    client: reqwest::Client,
    base_url: String,
    parser: R,
}

impl<R: ResponseParser> HttpLyricsProvider<R> {
    pub fn new(client: reqwest::Client, base_url: String, parser: R) -> Self {
        Self {
            client,
            base_url,
            parser,
        }
    }
}

#[async_trait]
impl<R: ResponseParser> UpstreamProvider for HttpLyricsProvider<R> {
    async fn fetch(
        &self,
        request: &LyricsRequest,
        account: &Account,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut query = vec![
            ("song", request.song.clone()),
            ("artist", request.artist.clone()),
        ];
        if let Some(album) = &request.album {
            query.push(("album", album.clone()));
        }
        if let Some(duration_ms) = request.duration_ms {
            query.push(("durationMs", duration_ms.to_string()));
        }
        if let Some(delta_ms) = request.duration_match_delta_ms {
            query.push(("durationMatchDeltaMs", delta_ms.to_string()));
        }

        let response = self
            .client
            .get(&self.base_url)
            .bearer_auth(&account.bearer_token)
            .header("X-Media-User-Token", &account.media_user_token)
            .query(&query)
            .send()
            .await
            .map_err(|err| ProviderError::Other(err.to_string()))?;

        match response.status().as_u16() {
            401 | 403 => Err(ProviderError::Auth),
            429 => Err(ProviderError::RateLimited),
            200 => {
                let body: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|err| ProviderError::Other(err.to_string()))?;
                self.parser.parse(&body)
            }
            status => Err(ProviderError::Other(format!(
                "upstream responded with status {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn default_parser_reads_documented_fields() {
        let body = json!({
            "lyrics": "la la la",
            "trackDurationMs": 233_000,
            "score": 0.87,
            "language": "en",
            "isRTL": false,
        });
        let response = DefaultResponseParser
            .parse(&body)
            .unwrap_or_else(|e| panic!("{e:?}"));
        assert_eq!(response.lyrics, "la la la");
        assert_eq!(response.track_duration_ms, 233_000);
        assert_eq!(response.language.as_deref(), Some("en"));
    }

    #[test]
    fn default_parser_surfaces_error_field_as_provider_error() {
        let body = json!({ "error": "no track found" });
        let err = DefaultResponseParser.parse(&body).unwrap_err();
        assert_eq!(err, ProviderError::Other("no track found".to_string()));
    }

    #[test]
    fn default_parser_treats_empty_lyrics_as_error() {
        let body = json!({ "lyrics": "" });
        let err = DefaultResponseParser.parse(&body).unwrap_err();
        assert_eq!(err, ProviderError::Other("TTML content is empty".to_string()));
    }

    struct ScriptedProvider {
        responses: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl UpstreamProvider for ScriptedProvider {
        async fn fetch(
            &self,
            _request: &LyricsRequest,
            _account: &Account,
        ) -> Result<ProviderResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
            if responses.is_empty() {
                Err(ProviderError::Other("no more scripted responses".to_string()))
            } else {
                responses.remove(0)
            }
        }
    }

    fn request() -> LyricsRequest {
        LyricsRequest {
            song: "song".to_string(),
            artist: "artist".to_string(),
            album: None,
            duration_ms: None,
            duration_match_delta_ms: None,
        }
    }

    fn account(name: &str) -> Account {
        Account {
            name: name.to_string(),
            bearer_token: "token".to_string(),
            media_user_token: "media".to_string(),
        }
    }

    fn success() -> ProviderResponse {
        ProviderResponse {
            lyrics: "la la la".to_string(),
            track_duration_ms: 1000,
            score: 1.0,
            language: None,
            is_rtl: None,
        }
    }

    #[tokio::test]
    async fn failover_skips_auth_failure_and_succeeds_on_next_account() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Auth), Ok(success())]);
        let pool = AccountPool::new(vec![account("a1"), account("a2"), account("a3")]);
        let breaker = CircuitBreaker::new(1, 3, Duration::from_secs(60), Duration::from_secs(60));
        let fetcher = UpstreamFetcher::new(provider, pool, breaker, Duration::from_secs(1));

        let result = fetcher.fetch(&request()).await;
        assert_eq!(result, Ok(success()));
        assert_eq!(fetcher.breaker().snapshot().failures, 0);
    }

    #[tokio::test]
    async fn empty_pool_returns_unavailable_without_panicking() {
        let provider = ScriptedProvider::new(vec![]);
        let pool = AccountPool::new(vec![]);
        let breaker = CircuitBreaker::new(1, 0, Duration::from_secs(60), Duration::from_secs(60));
        let fetcher = UpstreamFetcher::new(provider, pool, breaker, Duration::from_secs(1));

        let result = fetcher.fetch(&request()).await;
        assert_eq!(result, Err(UpstreamErrorKind::Unavailable));
    }

    #[tokio::test]
    async fn breaker_open_short_circuits_without_calling_provider() {
        let provider = ScriptedProvider::new(vec![Ok(success())]);
        let pool = AccountPool::new(vec![account("a1")]);
        let breaker = CircuitBreaker::new(1, 1, Duration::from_secs(60), Duration::from_secs(60));
        breaker.record_failure();
        let fetcher = UpstreamFetcher::new(provider, pool, breaker, Duration::from_secs(1));

        let result = fetcher.fetch(&request()).await;
        assert_eq!(result, Err(UpstreamErrorKind::Unavailable));
        assert_eq!(fetcher.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn other_error_returns_immediately_without_trying_remaining_accounts() {
        let provider = ScriptedProvider::new(vec![Err(ProviderError::Other("no track found".to_string()))]);
        let pool = AccountPool::new(vec![account("a1"), account("a2")]);
        let breaker = CircuitBreaker::new(5, 2, Duration::from_secs(60), Duration::from_secs(60));
        let fetcher = UpstreamFetcher::new(provider, pool, breaker, Duration::from_secs(1));

        let result = fetcher.fetch(&request()).await;
        assert_eq!(
            result,
            Err(UpstreamErrorKind::Failed("no track found".to_string()))
        );
        assert_eq!(fetcher.provider.calls.load(Ordering::SeqCst), 1);
    }
}
