//! Client-side value compression.
//!
//! Compression is a client decision: the value is JSON-serialised, gzipped,
//! and base64-encoded, and the broker stores the resulting string opaquely
//! with `compressed: true`. Reads reverse the pipeline. Payloads under the
//! configured threshold are sent uncompressed; gzip overhead would only
//! grow them.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use thiserror::Error;

/// Failures in the compression pipeline.
#[derive(Debug, Error)]
pub enum CompressError {
    /// gzip failed.
    #[error("gzip error: {0}")]
    Gzip(#[from] std::io::Error),

    /// The blob is not valid base64.
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decompressed bytes are not valid JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The broker marked the value compressed but it is not a string.
    #[error("compressed value is not a base64 string")]
    NotAString,
}

/// Serialised size of a value as the broker would measure it: raw length
/// for strings, serialised length otherwise.
#[must_use]
pub fn value_size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        other => serde_json::to_vec(other).map_or(0, |bytes| bytes.len()),
    }
}

/// Compresses a value into a base64 gzip blob.
///
/// Returns the blob with the pre- and post-compression byte counts the
/// broker records as compression metrics.
///
/// # Errors
///
/// Returns [`CompressError`] when serialisation or gzip fails.
pub fn compress_value(value: &Value) -> Result<(String, u64, u64), CompressError> {
    let serialized = serde_json::to_vec(value)?;
    let before = serialized.len() as u64;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&serialized)?;
    let compressed = encoder.finish()?;

    let blob = BASE64.encode(&compressed);
    let after = blob.len() as u64;
    Ok((blob, before, after))
}

/// Reverses [`compress_value`].
///
/// # Errors
///
/// Returns [`CompressError`] when the blob is not base64, not gzip, or
/// does not decompress to JSON.
pub fn decompress_value(blob: &str) -> Result<Value, CompressError> {
    let compressed = BASE64.decode(blob)?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut serialized = Vec::new();
    decoder.read_to_end(&mut serialized)?;
    Ok(serde_json::from_slice(&serialized)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn roundtrip_preserves_value() {
        let original = json!({
            "token": "abc123",
            "counts": [1, 2, 3],
            "nested": { "deep": true },
        });
        let (blob, before, after) = compress_value(&original).unwrap();
        assert!(before > 0);
        assert!(after > 0);
        assert_eq!(decompress_value(&blob).unwrap(), original);
    }

    #[test]
    fn repetitive_payloads_shrink() {
        let padded = json!({ "data": "x".repeat(8_192) });
        let (_, before, after) = compress_value(&padded).unwrap();
        assert!(after < before, "{after} should be under {before}");
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(matches!(
            decompress_value("!!! not base64 !!!"),
            Err(CompressError::Base64(_))
        ));
    }

    #[test]
    fn valid_base64_invalid_gzip_is_rejected() {
        let blob = BASE64.encode(b"plainly not gzip");
        assert!(matches!(
            decompress_value(&blob),
            Err(CompressError::Gzip(_))
        ));
    }

    #[test]
    fn value_size_measures_strings_raw() {
        assert_eq!(value_size(&json!("abcd")), 4);
        // Objects measure serialised: {"a":1} is 7 bytes.
        assert_eq!(value_size(&json!({ "a": 1 })), 7);
    }
}
