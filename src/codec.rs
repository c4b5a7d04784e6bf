//! Deterministic string -> compressed-text round trip for stored values.
//!
//! Values are gzip-compressed then base64-encoded so the result stays a
//! printable string, matching the plain-text legacy record shape the cache
//! engine must also be able to read.

use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("gzip compression failed: {0}")]
    Compress(#[source] std::io::Error),
    #[error("gzip decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),
}

const BASE64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

/// Compresses `s`, returning a base64-encoded, printable string.
pub fn compress(s: &str) -> Result<String, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(s.as_bytes())
        .map_err(CodecError::Compress)?;
    let bytes = encoder.finish().map_err(CodecError::Compress)?;
    Ok(BASE64.encode(bytes))
}

/// Inverse of [`compress`]. `decompress(compress(s)) == s` for all `s`.
pub fn decompress(encoded: &str) -> Result<String, CodecError> {
    let bytes = BASE64.decode(encoded)?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut out = String::new();
    decoder
        .read_to_string(&mut out)
        .map_err(CodecError::Decompress)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_holds_for_arbitrary_strings() {
        for s in ["", "a", "hello world", &"x".repeat(10_000), "日本語のテスト"] {
            let compressed = compress(s).unwrap_or_else(|e| panic!("compress failed: {e}"));
            let restored =
                decompress(&compressed).unwrap_or_else(|e| panic!("decompress failed: {e}"));
            assert_eq!(restored, s);
        }
    }

    #[test]
    fn compressed_output_is_base64_printable() {
        let compressed = compress("some lyrics text").unwrap_or_else(|e| panic!("{e}"));
        assert!(compressed.chars().all(|c| c.is_ascii_graphic()));
    }

    #[test]
    fn decompress_rejects_garbage_input() {
        assert!(decompress("not valid base64 !!!").is_err());
    }
}
