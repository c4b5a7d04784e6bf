//! Environment-variable configuration: read once at startup, fail loudly on
//! missing required values, fall back to documented defaults otherwise.

use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::time::Duration;

use crate::accounts::Account;

pub struct Config {
    pub addr: SocketAddr,
    pub accounts: Vec<Account>,
    pub api_keys: Vec<String>,
    pub admin_token: String,

    pub rate_limit_per_second: u32,
    pub rate_limit_burst: u32,
    pub cached_rate_limit_per_second: u32,
    pub cached_rate_limit_burst: u32,
    pub rate_limit_sweep_interval: Duration,

    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
    pub circuit_breaker_half_open_timeout: Duration,

    pub duration_match_delta_ms: u64,
    pub duration_tolerance_seconds: i64,
    pub negative_cache_ttl: Duration,
    pub cache_compression: bool,

    pub upstream_timeout: Duration,
    pub coalesce_grace: Duration,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_var(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port: u16 = env_parsed("PORT", 8080);
        let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

        let bearer_tokens = env_var("BEARER_TOKENS")
            .map(|v| split_csv(&v))
            .unwrap_or_default();
        let media_user_tokens = env_var("MEDIA_USER_TOKENS")
            .map(|v| split_csv(&v))
            .unwrap_or_default();
        if bearer_tokens.len() != media_user_tokens.len() {
            return Err(anyhow!(
                "BEARER_TOKENS and MEDIA_USER_TOKENS must have the same number of comma-separated entries (one account per index)"
            ));
        }
        let accounts = bearer_tokens
            .into_iter()
            .zip(media_user_tokens)
            .enumerate()
            .map(|(i, (bearer_token, media_user_token))| Account {
                name: format!("account-{i}"),
                bearer_token,
                media_user_token,
            })
            .collect();

        let api_keys = env_var("API_KEYS")
            .map(|v| split_csv(&v))
            .unwrap_or_default();

        let admin_token =
            env_var("ADMIN_TOKEN").ok_or_else(|| anyhow!("ADMIN_TOKEN is not set"))?;

        Ok(Self {
            addr,
            accounts,
            api_keys,
            admin_token,

            rate_limit_per_second: env_parsed("RATE_LIMIT_PER_SECOND", 5),
            rate_limit_burst: env_parsed("RATE_LIMIT_BURST", 10),
            cached_rate_limit_per_second: env_parsed("CACHED_RATE_LIMIT_PER_SECOND", 20),
            cached_rate_limit_burst: env_parsed("CACHED_RATE_LIMIT_BURST", 40),
            rate_limit_sweep_interval: Duration::from_secs(env_parsed("RATE_LIMIT_SWEEP_SECS", 300)),

            circuit_breaker_threshold: env_parsed("CIRCUIT_BREAKER_THRESHOLD", 5),
            circuit_breaker_cooldown: Duration::from_secs(env_parsed(
                "CIRCUIT_BREAKER_COOLDOWN_SECS",
                30,
            )),
            circuit_breaker_half_open_timeout: Duration::from_secs(env_parsed(
                "CIRCUIT_BREAKER_HALF_OPEN_TIMEOUT_SECS",
                10,
            )),

            duration_match_delta_ms: env_parsed("DURATION_MATCH_DELTA_MS", 2000),
            duration_tolerance_seconds: env_parsed("DURATION_TOLERANCE_SECONDS", 2),
            negative_cache_ttl: Duration::from_secs(env_parsed::<u64>("NEGATIVE_CACHE_TTL_DAYS", 7) * 86_400),
            cache_compression: env_parsed("CACHE_COMPRESSION", false),

            upstream_timeout: Duration::from_millis(env_parsed("UPSTREAM_TIMEOUT_MS", 5000)),
            coalesce_grace: Duration::from_millis(env_parsed("COALESCE_GRACE_MS", 1000)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn mismatched_account_token_lengths_fail_loudly() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("BEARER_TOKENS", "a,b");
        std::env::set_var("MEDIA_USER_TOKENS", "x");
        std::env::set_var("ADMIN_TOKEN", "admin");
        let result = Config::from_env();
        std::env::remove_var("BEARER_TOKENS");
        std::env::remove_var("MEDIA_USER_TOKENS");
        std::env::remove_var("ADMIN_TOKEN");
        assert!(result.is_err());
    }

    #[test]
    fn missing_admin_token_fails_loudly() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::remove_var("ADMIN_TOKEN");
        std::env::remove_var("BEARER_TOKENS");
        std::env::remove_var("MEDIA_USER_TOKENS");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn defaults_apply_when_optional_vars_are_absent() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::remove_var("BEARER_TOKENS");
        std::env::remove_var("MEDIA_USER_TOKENS");
        std::env::set_var("ADMIN_TOKEN", "admin");
        let config = Config::from_env().unwrap_or_else(|e| panic!("{e}"));
        std::env::remove_var("ADMIN_TOKEN");
        assert!(config.accounts.is_empty());
        assert_eq!(config.duration_tolerance_seconds, 2);
        assert_eq!(config.negative_cache_ttl, Duration::from_secs(7 * 86_400));
    }
}
