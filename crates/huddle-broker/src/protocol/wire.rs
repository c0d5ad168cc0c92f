//! Request and response shapes.
//!
//! Requests always carry `action`; responses always carry `ok`. Every
//! other field is optional and action-specific, so the request decodes
//! into one permissive struct rather than a tagged enum — unknown fields
//! are ignored, matching how co-operating clients evolve.

use serde::Deserialize;
use serde_json::{json, Value};

use super::error::ErrorToken;

/// One decoded request frame.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Operation selector; dispatch matches on this string.
    #[serde(default)]
    pub action: Option<String>,
    /// Value-store key, or the lease pool key for `lease`.
    #[serde(default)]
    pub key: Option<String>,
    /// Opaque value payload for `set`.
    #[serde(default)]
    pub value: Option<Value>,
    /// Time to live in milliseconds.
    #[serde(default)]
    pub ttl: Option<i64>,
    /// Client-side compression marker, echoed back on `get`.
    #[serde(default)]
    pub compressed: Option<bool>,
    /// Pre-compression byte count hint.
    #[serde(default)]
    pub before_size: Option<u64>,
    /// Post-compression byte count hint.
    #[serde(default)]
    pub after_size: Option<u64>,
    /// Lease holder identity.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Request signature; consumed by the authenticator, not dispatch.
    #[serde(default)]
    pub hmac: Option<Value>,
}

impl Request {
    /// Decodes a raw frame.
    ///
    /// # Errors
    ///
    /// Returns the serde error when the bytes are not a JSON object of the
    /// expected shape; the pipeline maps this to `invalid_json`.
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

/// `{"ok":true}` with optional extra members.
#[must_use]
pub fn ok_response() -> Value {
    json!({ "ok": true })
}

/// `{"ok":false,"error":<token>}`.
#[must_use]
pub fn error_response(token: ErrorToken) -> Value {
    json!({ "ok": false, "error": token.as_str() })
}

/// Serialises a response object into frame bytes (no terminator; the codec
/// appends it).
#[must_use]
pub fn to_frame(response: &Value) -> Vec<u8> {
    // A serde_json::Value of objects and primitives cannot fail to
    // serialise.
    serde_json::to_vec(response).unwrap_or_else(|_| br#"{"ok":false}"#.to_vec())
}
