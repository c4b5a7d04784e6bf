//! Stored value shapes: structured positive entries (with a legacy
//! plain-string fallback) and negative entries with lazily-evaluated TTL.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A cached lyrics result. Readers must also accept a bare string as
/// "legacy plain lyrics with unknown duration/score" — see [`deserialize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricsEntry {
    pub lyrics: String,
    pub track_duration_ms: Option<u64>,
    pub score: Option<f64>,
    pub language: Option<String>,
    pub is_rtl: Option<bool>,
}

impl LyricsEntry {
    pub fn new(lyrics: impl Into<String>, track_duration_ms: u64, score: f64) -> Self {
        Self {
            lyrics: lyrics.into(),
            track_duration_ms: Some(track_duration_ms),
            score: Some(score),
            language: None,
            is_rtl: None,
        }
    }

    fn legacy(lyrics: impl Into<String>) -> Self {
        Self {
            lyrics: lyrics.into(),
            track_duration_ms: None,
            score: None,
            language: None,
            is_rtl: None,
        }
    }

    /// Writers always emit the structured form.
    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.lyrics.clone())
    }

    /// Structured parse first; on failure, or an empty `lyrics` field, treat
    /// `raw` as legacy plain lyrics with unknown duration/score.
    pub fn deserialize(raw: &str) -> Self {
        match serde_json::from_str::<Self>(raw) {
            Ok(entry) if !entry.lyrics.is_empty() => entry,
            _ => Self::legacy(raw),
        }
    }
}

/// Evidence that no lyrics exist for a key. TTL is checked lazily on read;
/// [`NegativeEntry::is_expired`] is the single source of truth for that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegativeEntry {
    pub reason: String,
    pub timestamp: u64,
}

impl NegativeEntry {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            timestamp: unix_now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        let age = unix_now().saturating_sub(self.timestamp);
        age >= ttl.as_secs()
    }

    pub fn serialize(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.reason.clone())
    }

    pub fn deserialize(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
