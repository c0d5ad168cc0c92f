//! huddle-client — client library for the huddle broker.
//!
//! A blocking Unix-socket client. Each request opens a line-oriented
//! exchange on a shared connection: one JSON object out, one JSON object
//! back, newline-terminated. Connect-time failures (missing socket,
//! refused, pipe closed) are retried on the 50/100/200/400/800 ms schedule
//! bounded by a total deadline; broker-reported errors surface their token
//! verbatim and are never retried.
//!
//! Values above the compression threshold are gzipped and base64-encoded
//! before sending (`compressed: true`); reads reverse the pipeline
//! transparently. When the broker requires TTLs the client can reject a
//! TTL-less `set` locally, saving the round trip.

pub mod compress;

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::compress::{compress_value, decompress_value, value_size};

type HmacSha256 = Hmac<Sha256>;

/// Environment variable carrying the broker endpoint path.
pub const ENDPOINT_ENV_VAR: &str = "BROKER_ENDPOINT";

/// Environment variable carrying the shared HMAC secret.
pub const SECRET_ENV_VAR: &str = "BROKER_SECRET";

/// Default total deadline for connect retries and request I/O.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default compression threshold in bytes.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1_024;

/// Connect retry delays; the last step repeats until the deadline.
const RETRY_SCHEDULE_MS: [u64; 5] = [50, 100, 200, 400, 800];

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The endpoint is not configured and `BROKER_ENDPOINT` is unset.
    #[error("broker endpoint not configured and {ENDPOINT_ENV_VAR} is unset")]
    EndpointNotConfigured,

    /// The broker never became reachable within the deadline.
    #[error(
        "broker unreachable after {attempts} attempts over {elapsed_ms} ms \
         (last error: {last_error})"
    )]
    Unreachable {
        /// Connection attempts made.
        attempts: u32,
        /// Wall time spent, milliseconds.
        elapsed_ms: u64,
        /// The final connect error.
        last_error: std::io::Error,
    },

    /// Non-retryable I/O failure mid-request.
    #[error("broker I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The response line was not valid JSON.
    #[error("malformed broker response: {0}")]
    MalformedResponse(#[from] serde_json::Error),

    /// The broker answered `{"ok":false}`; the token is verbatim.
    #[error("broker error: {token}")]
    Broker {
        /// The wire token, e.g. `not_found` or `auth_failed`.
        token: String,
    },

    /// A compressed value failed to decode.
    #[error(
        "failed to decompress value for key {key:?}: {source}; the broker \
         and client may be running different versions"
    )]
    Decompression {
        /// The key whose value failed to decode.
        key: String,
        /// The pipeline failure.
        #[source]
        source: compress::CompressError,
    },
}

impl ClientError {
    /// The broker token, when this error carries one.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        match self {
            Self::Broker { token } => Some(token),
            _ => None,
        }
    }
}

/// One entry from `list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ListEntry {
    /// Absolute expiry, wall-clock milliseconds.
    pub expires: u64,
    /// Whether a value is held (always true for live entries).
    #[serde(rename = "hasValue")]
    pub has_value: bool,
}

/// Broker client.
///
/// Cheap to construct; connections are opened per request and retried on
/// connect-time failures only.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    endpoint: PathBuf,
    secret: Option<String>,
    timeout: Duration,
    require_ttl: bool,
    compression: bool,
    compression_threshold: usize,
}

impl BrokerClient {
    /// Creates a client for an explicit endpoint path.
    #[must_use]
    pub fn new(endpoint: impl Into<PathBuf>) -> Self {
        Self {
            endpoint: endpoint.into(),
            secret: None,
            timeout: DEFAULT_TIMEOUT,
            require_ttl: true,
            compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }

    /// Creates a client from `BROKER_ENDPOINT` and `BROKER_SECRET`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::EndpointNotConfigured`] when the endpoint
    /// variable is unset.
    pub fn from_env() -> Result<Self, ClientError> {
        let endpoint =
            std::env::var(ENDPOINT_ENV_VAR).map_err(|_| ClientError::EndpointNotConfigured)?;
        let mut client = Self::new(endpoint);
        client.secret = std::env::var(SECRET_ENV_VAR).ok().filter(|s| !s.is_empty());
        Ok(client)
    }

    /// Sets the shared HMAC secret; requests are signed when present.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Sets the total deadline for connect retries and request I/O.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Controls the local TTL pre-check on `set`.
    #[must_use]
    pub const fn with_require_ttl(mut self, require_ttl: bool) -> Self {
        self.require_ttl = require_ttl;
        self
    }

    /// Controls compression and its threshold.
    #[must_use]
    pub const fn with_compression(mut self, enabled: bool, threshold: usize) -> Self {
        self.compression = enabled;
        self.compression_threshold = threshold;
        self
    }

    /// The endpoint this client talks to.
    #[must_use]
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    /// Round-trip check; returns the broker's wall-clock milliseconds.
    ///
    /// # Errors
    ///
    /// Transport or broker failures per [`ClientError`].
    pub fn ping(&self) -> Result<u64, ClientError> {
        let response = self.request(json!({ "action": "ping" }))?;
        Ok(response["pong"].as_u64().unwrap_or_default())
    }

    /// Stores a value, compressing it when worthwhile.
    ///
    /// # Errors
    ///
    /// `ttl_required` locally when TTLs are mandatory and `ttl` is `None`;
    /// otherwise transport or broker failures.
    pub fn set(&self, key: &str, value: &Value, ttl: Option<u64>) -> Result<(), ClientError> {
        if self.require_ttl && ttl.is_none() {
            // Pre-check saves the round trip; the token matches what the
            // broker would answer.
            return Err(ClientError::Broker {
                token: "ttl_required".to_string(),
            });
        }

        let mut frame = Map::new();
        frame.insert("action".to_string(), json!("set"));
        frame.insert("key".to_string(), json!(key));
        if let Some(ttl) = ttl {
            frame.insert("ttl".to_string(), json!(ttl));
        }

        if self.compression && value_size(value) >= self.compression_threshold {
            let (blob, before, after) = compress_value(value).map_err(|source| {
                ClientError::Decompression {
                    key: key.to_string(),
                    source,
                }
            })?;
            debug!(key, before, after, "compressing value");
            frame.insert("value".to_string(), json!(blob));
            frame.insert("compressed".to_string(), json!(true));
            frame.insert("beforeSize".to_string(), json!(before));
            frame.insert("afterSize".to_string(), json!(after));
        } else {
            frame.insert("value".to_string(), value.clone());
        }

        self.request(Value::Object(frame))?;
        Ok(())
    }

    /// Fetches a value, reversing compression when the broker echoes the
    /// flag.
    ///
    /// # Errors
    ///
    /// `not_found` and `expired` surface as [`ClientError::Broker`];
    /// undecodable compressed blobs as [`ClientError::Decompression`].
    pub fn get(&self, key: &str) -> Result<Value, ClientError> {
        let response = self.request(json!({ "action": "get", "key": key }))?;
        let compressed = response["compressed"].as_bool().unwrap_or(false);
        let value = response.get("value").cloned().unwrap_or(Value::Null);

        if !compressed {
            return Ok(value);
        }
        let Value::String(blob) = value else {
            return Err(ClientError::Decompression {
                key: key.to_string(),
                source: compress::CompressError::NotAString,
            });
        };
        decompress_value(&blob).map_err(|source| ClientError::Decompression {
            key: key.to_string(),
            source,
        })
    }

    /// Deletes a key. Deleting an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Transport or broker failures per [`ClientError`].
    pub fn del(&self, key: &str) -> Result<(), ClientError> {
        self.request(json!({ "action": "del", "key": key }))?;
        Ok(())
    }

    /// Lists live keys with their expiries; values are not included.
    ///
    /// # Errors
    ///
    /// Transport or broker failures per [`ClientError`].
    pub fn list(&self) -> Result<HashMap<String, ListEntry>, ClientError> {
        let response = self.request(json!({ "action": "list" }))?;
        let items = response.get("items").cloned().unwrap_or(json!({}));
        Ok(serde_json::from_value(items)?)
    }

    /// Claims (or renews) a lease in a pool, returning the dense integer.
    ///
    /// # Errors
    ///
    /// `worker_already_has_lease` and `key_and_worker_required` surface as
    /// [`ClientError::Broker`].
    pub fn lease(
        &self,
        pool_key: &str,
        worker_id: &str,
        ttl: Option<u64>,
    ) -> Result<u64, ClientError> {
        let mut frame = Map::new();
        frame.insert("action".to_string(), json!("lease"));
        frame.insert("key".to_string(), json!(pool_key));
        frame.insert("workerId".to_string(), json!(worker_id));
        if let Some(ttl) = ttl {
            frame.insert("ttl".to_string(), json!(ttl));
        }
        let response = self.request(Value::Object(frame))?;
        Ok(response["value"].as_u64().unwrap_or_default())
    }

    /// Releases a worker's lease, reporting whether one was held.
    ///
    /// # Errors
    ///
    /// Transport or broker failures per [`ClientError`].
    pub fn release(&self, worker_id: &str) -> Result<bool, ClientError> {
        let response = self.request(json!({ "action": "release", "workerId": worker_id }))?;
        Ok(response["released"].as_bool().unwrap_or(false))
    }

    /// Fetches the stats snapshot.
    ///
    /// # Errors
    ///
    /// Transport or broker failures per [`ClientError`].
    pub fn stats(&self) -> Result<Value, ClientError> {
        let response = self.request(json!({ "action": "stats" }))?;
        Ok(response.get("stats").cloned().unwrap_or(Value::Null))
    }

    /// Fetches the health snapshot.
    ///
    /// # Errors
    ///
    /// Transport or broker failures per [`ClientError`].
    pub fn health(&self) -> Result<Value, ClientError> {
        self.request(json!({ "action": "health" }))
    }

    /// Fetches the Prometheus exposition text.
    ///
    /// # Errors
    ///
    /// Transport or broker failures per [`ClientError`].
    pub fn metrics_text(&self) -> Result<String, ClientError> {
        let response = self.request(json!({ "action": "metrics" }))?;
        Ok(response["metrics"].as_str().unwrap_or_default().to_string())
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Sends one frame and reads one response line.
    ///
    /// # Errors
    ///
    /// Transport failures, malformed responses, or `{"ok":false}` answers
    /// (token surfaced verbatim).
    pub fn request(&self, frame: Value) -> Result<Value, ClientError> {
        let line = self.encode_frame(&frame)?;
        let stream = self.connect_with_retry()?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut writer = &stream;
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        let mut reader = BufReader::new(&stream);
        let mut response_line = String::new();
        reader.read_line(&mut response_line)?;

        let response: Value = serde_json::from_str(&response_line)?;
        if response["ok"].as_bool() == Some(true) {
            Ok(response)
        } else {
            Err(ClientError::Broker {
                token: response["error"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
            })
        }
    }

    /// Serialises and, when a secret is configured, signs a frame.
    ///
    /// The signature covers the serialised frame without the `hmac`
    /// member; the member is then spliced in front, so the bytes after it
    /// are exactly the signed bytes.
    fn encode_frame(&self, frame: &Value) -> Result<Vec<u8>, ClientError> {
        let canonical = serde_json::to_vec(frame)?;
        let Some(secret) = &self.secret else {
            return Ok(canonical);
        };

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("HMAC key of any length is accepted");
        mac.update(&canonical);
        let hmac = hex::encode(mac.finalize().into_bytes());

        let mut signed = format!("{{\"hmac\":\"{hmac}\"").into_bytes();
        if canonical.len() > 2 {
            signed.push(b',');
            signed.extend_from_slice(&canonical[1..]);
        } else {
            signed.push(b'}');
        }
        Ok(signed)
    }

    /// Connects, retrying connect-time failures on the backoff schedule
    /// until the deadline.
    fn connect_with_retry(&self) -> Result<UnixStream, ClientError> {
        let started = Instant::now();
        let mut attempts = 0u32;
        let mut delays = RETRY_SCHEDULE_MS.iter().copied();
        let mut delay_ms = 0;

        loop {
            attempts += 1;
            match UnixStream::connect(&self.endpoint) {
                Ok(stream) => return Ok(stream),
                Err(e) if is_retryable_connect(&e) => {
                    delay_ms = delays.next().unwrap_or(delay_ms.max(1));
                    let elapsed = started.elapsed();
                    if elapsed + Duration::from_millis(delay_ms) >= self.timeout {
                        return Err(ClientError::Unreachable {
                            attempts,
                            elapsed_ms: elapsed.as_millis() as u64,
                            last_error: e,
                        });
                    }
                    debug!(attempts, delay_ms, "broker not reachable yet, retrying");
                    std::thread::sleep(Duration::from_millis(delay_ms));
                },
                Err(e) => return Err(ClientError::Io(e)),
            }
        }
    }
}

/// Connect-time failures worth retrying: the broker may simply not be up
/// yet, or a stale socket may be mid-replacement.
fn is_retryable_connect(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::NotFound
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_frame_is_plain_serialisation() {
        let client = BrokerClient::new("/tmp/nowhere.sock");
        let line = client.encode_frame(&json!({ "action": "ping" })).unwrap();
        assert_eq!(line, br#"{"action":"ping"}"#);
    }

    #[test]
    fn signed_frame_prepends_hmac_member() {
        let client = BrokerClient::new("/tmp/nowhere.sock").with_secret("s3cret");
        let line = client.encode_frame(&json!({ "action": "ping" })).unwrap();
        let text = String::from_utf8(line.clone()).unwrap();
        assert!(text.starts_with(r#"{"hmac":""#));
        assert!(text.ends_with(r#","action":"ping"}"#));

        // The response must still parse as one object with both members.
        let parsed: Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(parsed["action"], "ping");
        assert_eq!(parsed["hmac"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn signature_matches_independent_computation() {
        let client = BrokerClient::new("/tmp/nowhere.sock").with_secret("s3cret");
        let frame = json!({ "action": "get", "key": "k" });
        let line = client.encode_frame(&frame).unwrap();
        let parsed: Value = serde_json::from_slice(&line).unwrap();

        let canonical = serde_json::to_vec(&frame).unwrap();
        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(&canonical);
        let expected = hex::encode(mac.finalize().into_bytes());
        assert_eq!(parsed["hmac"], json!(expected));
    }

    #[test]
    fn ttl_precheck_fails_locally() {
        let client = BrokerClient::new("/tmp/nowhere.sock");
        let err = client.set("k", &json!("v"), None).unwrap_err();
        assert_eq!(err.token(), Some("ttl_required"));
    }

    #[test]
    fn ttl_precheck_can_be_disabled() {
        // With the pre-check off the client actually dials the endpoint;
        // pointing at nowhere makes the transport error observable.
        let client = BrokerClient::new("/tmp/definitely-missing.sock")
            .with_require_ttl(false)
            .with_timeout(Duration::from_millis(60));
        let err = client.set("k", &json!("v"), None).unwrap_err();
        assert!(matches!(err, ClientError::Unreachable { .. }));
    }

    #[test]
    fn unreachable_error_reports_attempts_and_elapsed() {
        let client = BrokerClient::new("/tmp/definitely-missing.sock")
            .with_timeout(Duration::from_millis(120));
        let err = client.ping().unwrap_err();
        match err {
            ClientError::Unreachable {
                attempts,
                elapsed_ms,
                ..
            } => {
                assert!(attempts >= 2, "attempts = {attempts}");
                assert!(elapsed_ms < 5_000);
            },
            other => panic!("expected Unreachable, got {other:?}"),
        }
    }

    #[test]
    fn from_env_requires_endpoint() {
        // The variable is process-global; only assert the unset branch
        // when nothing else set it.
        if std::env::var(ENDPOINT_ENV_VAR).is_err() {
            assert!(matches!(
                BrokerClient::from_env(),
                Err(ClientError::EndpointNotConfigured)
            ));
        }
    }

    #[test]
    fn broker_error_token_is_verbatim() {
        let err = ClientError::Broker {
            token: "worker_already_has_lease".to_string(),
        };
        assert_eq!(err.token(), Some("worker_already_has_lease"));
        assert!(err.to_string().contains("worker_already_has_lease"));
    }
}
