//! Route handlers. Each one validates/rate-limits, delegates to the
//! pipeline, and renders the header contract from spec §6.

use crate::error::GatewayError;
use crate::kv::KvStore;
use crate::pipeline::{LyricsQuery, PipelineOutcome};
use crate::ratelimit::RateLimitDecision;
use crate::state::AppState;
use crate::upstream::UpstreamProvider;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;

#[derive(Debug, Deserialize)]
pub struct GetLyricsParams {
    pub s: Option<String>,
    pub a: Option<String>,
    pub al: Option<String>,
    pub d: Option<String>,
}

impl GetLyricsParams {
    fn into_query(self) -> LyricsQuery {
        LyricsQuery {
            song: self.s.unwrap_or_default(),
            artist: self.a.unwrap_or_default(),
            album: self.al.filter(|v| !v.is_empty()),
            // "If D is absent or unparsable, probe only the no-duration key."
            duration_secs: self.d.and_then(|v| v.parse::<i64>().ok()),
        }
    }
}

fn rate_limit_headers(headers: &mut HeaderMap, decision: RateLimitDecision, limit: u32) {
    let (type_str, remaining) = match decision {
        RateLimitDecision::Normal => ("normal", limit.saturating_sub(1)),
        RateLimitDecision::CacheOnly => ("cached", limit.saturating_sub(1)),
        RateLimitDecision::Exceeded => ("exceeded", 0),
    };
    headers.insert("X-RateLimit-Type", HeaderValue::from_static(type_str));
    if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", value);
    }
}

fn cache_status_header(headers: &mut HeaderMap, status: &'static str) {
    headers.insert("X-Cache-Status", HeaderValue::from_static(status));
}

fn auth_mode_header(headers: &mut HeaderMap, mode: &'static str) {
    headers.insert("X-Auth-Mode", HeaderValue::from_static(mode));
}

fn render_outcome(outcome: PipelineOutcome, lyrics_field: &'static str, provider: Option<&str>) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(provider) = provider {
        if let Ok(value) = HeaderValue::from_str(provider) {
            headers.insert("X-Provider", value);
        }
    }

    let (status, body) = match outcome {
        PipelineOutcome::Hit(body) => {
            cache_status_header(&mut headers, "HIT");
            let mut json = json!({ lyrics_field: body.ttml });
            if let Some(score) = body.score {
                json["score"] = json!(score);
            }
            if let Some(provider) = provider {
                json["provider"] = json!(provider);
            }
            (StatusCode::OK, json)
        }
        PipelineOutcome::Stale(body) => {
            cache_status_header(&mut headers, "STALE");
            let mut json = json!({ lyrics_field: body.ttml });
            if let Some(score) = body.score {
                json["score"] = json!(score);
            }
            if let Some(provider) = provider {
                json["provider"] = json!(provider);
            }
            (StatusCode::OK, json)
        }
        PipelineOutcome::NegativeHit(reason) => {
            cache_status_header(&mut headers, "NEGATIVE_HIT");
            (StatusCode::NOT_FOUND, json!({ "error": reason }))
        }
        PipelineOutcome::NotFoundPermanent(reason) => {
            cache_status_header(&mut headers, "MISS");
            (StatusCode::NOT_FOUND, json!({ "error": reason }))
        }
        PipelineOutcome::BadRequest => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "error": "song and artist must not both be empty" }),
        ),
        PipelineOutcome::CacheOnlyMiss => {
            cache_status_header(&mut headers, "MISS");
            headers.insert("Retry-After", HeaderValue::from_static("60"));
            (StatusCode::TOO_MANY_REQUESTS, json!({ "error": "cache-only mode: not cached" }))
        }
        PipelineOutcome::UpstreamTransient => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "upstream temporarily unavailable" }),
        ),
    };

    (status, headers, Json(body)).into_response()
}

async fn get_lyrics_impl<K: KvStore, P: UpstreamProvider>(
    state: &AppState<K, P>,
    addr: SocketAddr,
    params: GetLyricsParams,
    lyrics_field: &'static str,
    provider: Option<&str>,
) -> Response {
    let decision = state.rate_limiter.check(addr.ip());
    if decision == RateLimitDecision::Exceeded {
        state.stats.record_rate_limited();
        let mut headers = HeaderMap::new();
        rate_limit_headers(&mut headers, decision, state.normal_rate_limit);
        headers.insert("Retry-After", HeaderValue::from_static("1"));
        return (
            StatusCode::TOO_MANY_REQUESTS,
            headers,
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response();
    }

    let cache_only = decision == RateLimitDecision::CacheOnly;
    let limit = if cache_only { state.cached_rate_limit } else { state.normal_rate_limit };

    let outcome = match state.pipeline.handle(params.into_query(), cache_only).await {
        Ok(outcome) => outcome,
        Err(err) => return GatewayError::Internal(err).into_response(),
    };

    let mut response = render_outcome(outcome, lyrics_field, provider);
    rate_limit_headers(response.headers_mut(), decision, limit);
    if cache_only {
        auth_mode_header(response.headers_mut(), "cache");
    }
    response
}

pub async fn get_lyrics<K: KvStore, P: UpstreamProvider>(
    State(state): State<AppState<K, P>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<GetLyricsParams>,
) -> Response {
    get_lyrics_impl(&state, addr, params, "ttml", None).await
}

pub async fn get_lyrics_for_provider<K: KvStore, P: UpstreamProvider>(
    State(state): State<AppState<K, P>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(provider): Path<String>,
    Query(params): Query<GetLyricsParams>,
) -> Response {
    get_lyrics_impl(&state, addr, params, "lyrics", Some(&provider)).await
}

#[derive(Debug, Deserialize)]
pub struct RevalidateParams {
    pub s: String,
    pub a: String,
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
struct RevalidateResponse {
    updated: bool,
    #[serde(rename = "cacheKey")]
    cache_key: String,
    #[serde(rename = "wasNegativeCache")]
    was_negative_cache: bool,
}

pub async fn revalidate<K: KvStore, P: UpstreamProvider>(
    State(state): State<AppState<K, P>>,
    Query(params): Query<RevalidateParams>,
    headers: HeaderMap,
) -> Response {
    let provided_key = params
        .key
        .clone()
        .or_else(|| {
            headers
                .get("X-Api-Key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        });

    let authorized = match &provided_key {
        Some(key) => state.api_keys.iter().any(|configured| configured == key),
        None => false,
    };
    if !authorized {
        let mut response = GatewayError::Unauthorized.into_response();
        auth_mode_header(response.headers_mut(), "invalid");
        return response;
    }

    let query = LyricsQuery {
        song: params.s.clone(),
        artist: params.a.clone(),
        album: None,
        duration_secs: None,
    };

    let outcome = match state.pipeline.revalidate(&query).await {
        Ok(outcome) => outcome,
        Err(err) => return GatewayError::Internal(err).into_response(),
    };

    let mut response = Json(RevalidateResponse {
        updated: outcome.updated,
        cache_key: outcome.cache_key,
        was_negative_cache: outcome.was_negative_cache,
    })
    .into_response();
    auth_mode_header(response.headers_mut(), "authenticated");
    response
}

pub async fn health_check<K: KvStore, P: UpstreamProvider>(
    State(state): State<AppState<K, P>>,
) -> Response {
    let healthy = state.pipeline.health_check().await.unwrap_or(false);
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "status": if healthy { "ok" } else { "degraded" } }))).into_response()
}

pub async fn admin_stats<K: KvStore, P: UpstreamProvider>(
    State(state): State<AppState<K, P>>,
    headers: HeaderMap,
) -> Response {
    let authorized = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", state.admin_token))
        .unwrap_or(false);
    if !authorized {
        return GatewayError::Unauthorized.into_response();
    }
    Json(state.stats.snapshot()).into_response()
}
