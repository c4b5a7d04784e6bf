//! Cache key normalization and duration-tolerant probe ordering.

/// `normalize(s) = lowercase(trim(s))`. Idempotent: `normalize(normalize(s))
/// == normalize(s)`.
pub fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Builds the normalized key `"ttml_lyrics:{song} {artist}[ {album}][
/// {duration}s]"`. Empty album/duration segments are omitted entirely.
pub fn build_key(song: &str, artist: &str, album: Option<&str>, duration_secs: Option<i64>) -> String {
    let mut key = format!("ttml_lyrics:{} {}", normalize(song), normalize(artist));
    if let Some(album) = album {
        let album = normalize(album);
        if !album.is_empty() {
            key.push(' ');
            key.push_str(&album);
        }
    }
    if let Some(duration_secs) = duration_secs {
        key.push(' ');
        key.push_str(&duration_secs.to_string());
        key.push('s');
    }
    key
}

/// Builds the legacy key, preserving original casing and always joining with
/// spaces regardless of whether album is present (e.g.
/// `"ttml_lyrics:Song Artist "` when album is empty). Readers must probe
/// both forms; writers only ever emit [`build_key`].
pub fn build_legacy_key(song: &str, artist: &str, album: Option<&str>) -> String {
    format!("ttml_lyrics:{} {} {}", song, artist, album.unwrap_or(""))
}

/// `"no_lyrics:" + key` — the negative-cache key for any positive key.
pub fn negative_key(positive_key: &str) -> String {
    format!("no_lyrics:{positive_key}")
}

/// Probe order for duration-tolerant lookup: `D, D-1, D+1, D-2, D+2, ...,
/// D-T, D+T`, increasing `|delta|` then sign-alternating (negative first).
/// With `tolerance == 0` only `D` itself is probed.
pub fn duration_probe_order(duration_secs: i64, tolerance: i64) -> Vec<i64> {
    let mut order = vec![duration_secs];
    for delta in 1..=tolerance.max(0) {
        order.push(duration_secs - delta);
        order.push(duration_secs + delta);
    }
    order
}

/// Every normalized-key candidate to probe for a duration-tolerant lookup,
/// given an optional raw duration string from the query. Returns a single
/// no-duration key when `duration_secs` is `None` (absent or unparsable is
/// the caller's concern — it simply passes `None`).
pub fn candidate_keys(
    song: &str,
    artist: &str,
    album: Option<&str>,
    duration_secs: Option<i64>,
    tolerance: i64,
) -> Vec<String> {
    match duration_secs {
        None => vec![build_key(song, artist, album, None)],
        Some(d) => duration_probe_order(d, tolerance)
            .into_iter()
            .map(|candidate| build_key(song, artist, album, Some(candidate)))
            .collect(),
    }
}
