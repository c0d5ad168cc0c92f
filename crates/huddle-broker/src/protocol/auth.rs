//! Request authentication.
//!
//! When a shared secret is configured, every frame must carry an `hmac`
//! member: the lowercase hex of HMAC-SHA256 over the exact wire bytes of
//! the frame with the top-level `"hmac"` member textually removed. Working
//! on wire bytes rather than a re-serialisation means the two sides never
//! have to agree on key order or whitespace.
//!
//! Verification is total over untrusted input: missing members, non-string
//! members, bad hex, and wrong-length digests are all rejections, never
//! panics. Digest comparison is constant-time. The supplied digest is never
//! logged above debug level.

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Length of a hex-encoded SHA-256 digest.
const DIGEST_HEX_LEN: usize = 64;

/// Verifies frame signatures against a shared secret.
#[derive(Clone)]
pub struct Authenticator {
    secret: Vec<u8>,
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret must not leak through Debug output.
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

impl Authenticator {
    /// Creates an authenticator keyed by the shared secret.
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Verifies a frame.
    ///
    /// `raw` is the frame exactly as received (terminator stripped);
    /// `supplied` is the decoded `hmac` member, if any.
    #[must_use]
    pub fn verify(&self, raw: &[u8], supplied: Option<&Value>) -> bool {
        let Some(Value::String(supplied_hex)) = supplied else {
            debug!("auth rejected: hmac member missing or not a string");
            return false;
        };

        if supplied_hex.len() != DIGEST_HEX_LEN {
            debug!("auth rejected: digest has wrong length");
            return false;
        }
        let Ok(supplied_bytes) = hex::decode(supplied_hex) else {
            debug!("auth rejected: digest is not valid hex");
            return false;
        };

        let canonical = excise_member(raw, b"hmac");
        let expected = self.digest(&canonical);

        bool::from(expected.as_slice().ct_eq(supplied_bytes.as_slice()))
    }

    /// Computes the signature for a canonical (hmac-free) frame.
    ///
    /// Exposed so tests and in-process clients can produce valid frames.
    #[must_use]
    pub fn sign(&self, canonical: &[u8]) -> String {
        hex::encode(self.digest(canonical))
    }

    fn digest(&self, canonical: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC key of any length is accepted");
        mac.update(canonical);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Removes every top-level member named `key` from a serialized JSON
/// object, together with one adjacent comma per removal.
///
/// The scanner tracks nesting depth and string boundaries, so a member of
/// the same name inside a nested value, or the bytes `"hmac"` inside a
/// string literal, are left untouched. Malformed input cannot make it read
/// out of bounds; in the worst case the frame passes through unchanged and
/// verification fails on the digest.
fn excise_member(raw: &[u8], key: &[u8]) -> Vec<u8> {
    let spans = member_spans(raw, key);
    if spans.is_empty() {
        return raw.to_vec();
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut cursor = 0;
    for (start, end) in spans {
        let (start, end) = widen_over_comma(raw, start, end);
        if start >= cursor {
            out.extend_from_slice(&raw[cursor..start]);
            cursor = end;
        }
    }
    out.extend_from_slice(&raw[cursor..]);
    out
}

/// Locates `key: value` spans at depth 1 of the object.
fn member_spans(raw: &[u8], key: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < raw.len() {
        match raw[i] {
            b'"' => {
                let string_end = scan_string(raw, i);
                if depth == 1 {
                    // A depth-1 string is a key; confirm by finding its colon.
                    let mut j = string_end;
                    while j < raw.len() && raw[j].is_ascii_whitespace() {
                        j += 1;
                    }
                    if j < raw.len() && raw[j] == b':' {
                        let value_end = scan_value(raw, j + 1);
                        if string_end >= 2 && &raw[i + 1..string_end - 1] == key {
                            spans.push((i, value_end));
                        }
                        i = value_end;
                        continue;
                    }
                }
                i = string_end;
            },
            b'{' | b'[' => {
                depth += 1;
                i += 1;
            },
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                i += 1;
            },
            _ => i += 1,
        }
    }
    spans
}

/// Returns the index one past the closing quote of the string starting at
/// `start` (which must point at the opening quote).
fn scan_string(raw: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < raw.len() {
        match raw[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    raw.len()
}

/// Returns the index one past the JSON value starting at (or after
/// whitespace from) `start`.
fn scan_value(raw: &[u8], mut start: usize) -> usize {
    while start < raw.len() && raw[start].is_ascii_whitespace() {
        start += 1;
    }
    if start >= raw.len() {
        return raw.len();
    }
    match raw[start] {
        b'"' => scan_string(raw, start),
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut i = start;
            while i < raw.len() {
                match raw[i] {
                    b'"' => {
                        i = scan_string(raw, i);
                        continue;
                    },
                    b'{' | b'[' => depth += 1,
                    b'}' | b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return i + 1;
                        }
                    },
                    _ => {},
                }
                i += 1;
            }
            raw.len()
        },
        // Number, true, false, null: runs to a structural delimiter.
        _ => {
            let mut i = start;
            while i < raw.len() && !matches!(raw[i], b',' | b'}' | b']') && !raw[i].is_ascii_whitespace() {
                i += 1;
            }
            i
        },
    }
}

/// Extends a member span over one adjacent comma so the remainder stays
/// valid JSON: the trailing comma when the member is not last, otherwise
/// the leading one.
fn widen_over_comma(raw: &[u8], start: usize, end: usize) -> (usize, usize) {
    let mut j = end;
    while j < raw.len() && raw[j].is_ascii_whitespace() {
        j += 1;
    }
    if j < raw.len() && raw[j] == b',' {
        return (start, j + 1);
    }

    let mut k = start;
    while k > 0 && raw[k - 1].is_ascii_whitespace() {
        k -= 1;
    }
    if k > 0 && raw[k - 1] == b',' {
        return (k - 1, end);
    }
    (start, end)
}
