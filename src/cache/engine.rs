//! Positive/negative cache with normalized keys, duration-tolerant lookup,
//! stale fallback, and format-migration tolerance.

use super::entry::{LyricsEntry, NegativeEntry};
use super::key;
use crate::kv::KvStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Messages indicating definitive absence. Only these are cached negatively
/// — everything else (network, auth, rate-limit, timeout) is transient.
const PERMANENT_ABSENCE_MARKERS: &[&str] = &[
    "no track found",
    "no tracks found within",
    "ttml content is empty",
];

/// Returns true if `message` indicates the upstream definitively has no
/// lyrics for the request, as opposed to a transient failure. Substring
/// matching is a last-resort fallback; the upstream fetcher's tagged
/// `UpstreamErrorKind` is the primary classification (see `crate::upstream`).
pub fn is_permanent_absence(message: &str) -> bool {
    let lower = message.to_lowercase();
    PERMANENT_ABSENCE_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

pub struct CacheEngine<K: KvStore> {
    kv: Arc<K>,
    negative_ttl: Duration,
    duration_tolerance: i64,
    compression: bool,
}

impl<K: KvStore> CacheEngine<K> {
    pub fn new(kv: Arc<K>, negative_ttl: Duration, duration_tolerance: i64, compression: bool) -> Self {
        Self {
            kv,
            negative_ttl,
            duration_tolerance,
            compression,
        }
    }

    fn encode(&self, raw: &str) -> String {
        if self.compression {
            crate::codec::compress(raw).unwrap_or_else(|_| raw.to_string())
        } else {
            raw.to_string()
        }
    }

    fn decode(&self, stored: &[u8]) -> String {
        let raw = String::from_utf8_lossy(stored).into_owned();
        if self.compression {
            crate::codec::decompress(&raw).unwrap_or(raw)
        } else {
            raw
        }
    }

    pub async fn get_positive(&self, key: &str) -> anyhow::Result<Option<LyricsEntry>> {
        let Some(raw) = self.kv.get(key).await? else {
            return Ok(None);
        };
        Ok(Some(LyricsEntry::deserialize(&self.decode(&raw))))
    }

    /// Writes a positive entry, and deletes any negative entry for the same
    /// key so the two never coexist (§3 invariant).
    pub async fn set_positive(&self, key: &str, entry: &LyricsEntry) -> anyhow::Result<()> {
        let encoded = self.encode(&entry.serialize());
        self.kv.set(key, encoded.into_bytes()).await?;
        self.kv.delete(&key::negative_key(key)).await?;
        Ok(())
    }

    /// Returns the negative reason if present and not expired; expired
    /// entries are deleted as a side effect of being read.
    pub async fn get_negative(&self, key: &str) -> anyhow::Result<Option<String>> {
        let neg_key = key::negative_key(key);
        let Some(raw) = self.kv.get(&neg_key).await? else {
            return Ok(None);
        };
        let Some(entry) = NegativeEntry::deserialize(&self.decode(&raw)) else {
            return Ok(None);
        };
        if entry.is_expired(self.negative_ttl) {
            debug!(%neg_key, "negative cache entry expired on read, deleting");
            self.kv.delete(&neg_key).await?;
            return Ok(None);
        }
        Ok(Some(entry.reason))
    }

    /// Writes a negative entry, and deletes any positive entry for the same
    /// key so the two never coexist (§3 invariant).
    pub async fn set_negative(&self, key: &str, reason: &str) -> anyhow::Result<()> {
        let entry = NegativeEntry::new(reason);
        let encoded = self.encode(&entry.serialize());
        self.kv
            .set(&key::negative_key(key), encoded.into_bytes())
            .await?;
        self.kv.delete(key).await?;
        Ok(())
    }

    /// Probes duration candidates in increasing-delta, sign-alternating
    /// order; the first hit wins. With no duration, probes only the
    /// no-duration key.
    pub async fn get_with_duration_tolerance(
        &self,
        song: &str,
        artist: &str,
        album: Option<&str>,
        duration_secs: Option<i64>,
    ) -> anyhow::Result<Option<(LyricsEntry, String)>> {
        for candidate in key::candidate_keys(song, artist, album, duration_secs, self.duration_tolerance) {
            if let Some(entry) = self.get_positive(&candidate).await? {
                return Ok(Some((entry, candidate)));
            }
        }
        Ok(None)
    }

    /// Same probing strategy as [`Self::get_with_duration_tolerance`],
    /// applied to the negative cache.
    pub async fn get_negative_with_duration_tolerance(
        &self,
        song: &str,
        artist: &str,
        album: Option<&str>,
        duration_secs: Option<i64>,
    ) -> anyhow::Result<Option<(String, String)>> {
        for candidate in key::candidate_keys(song, artist, album, duration_secs, self.duration_tolerance) {
            if let Some(reason) = self.get_negative(&candidate).await? {
                return Ok(Some((reason, candidate)));
            }
        }
        Ok(None)
    }

    /// Secondary lookup for stale-serve on upstream failure: drops the
    /// album, keeps the duration. Dropped-duration fallbacks are never
    /// generated — duration is identity-relevant.
    pub async fn health_check(&self) -> anyhow::Result<bool> {
        self.kv.health_check().await
    }

    pub async fn get_stale_fallback(
        &self,
        song: &str,
        artist: &str,
        duration_secs: Option<i64>,
    ) -> anyhow::Result<Option<(LyricsEntry, String)>> {
        self.get_with_duration_tolerance(song, artist, None, duration_secs)
            .await
    }
}
