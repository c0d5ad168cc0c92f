//! Protocol error types and wire error tokens.

use thiserror::Error;

/// Short lowercase tokens carried in `{"ok":false,"error":…}` responses.
///
/// The full taxonomy: input shape, policy, lookup, security, and lifecycle
/// failures. `already_running` is deliberately absent; it is a start-time
/// diagnostic that never crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorToken {
    /// A frame was not a valid JSON object.
    InvalidJson,
    /// The `action` string is not recognised.
    UnknownAction,
    /// A frame or value exceeded its size cap.
    TooLarge,
    /// `lease` without a pool key or worker id.
    KeyAndWorkerRequired,
    /// `release` without a worker id.
    WorkerRequired,
    /// `set` without a TTL while TTLs are mandatory.
    TtlRequired,
    /// `set` with a zero or negative TTL.
    InvalidTtl,
    /// The store is at its non-expired item cap.
    MaxItems,
    /// The worker holds a non-expired lease in another pool.
    WorkerAlreadyHasLease,
    /// The key is absent.
    NotFound,
    /// The key existed but its TTL has passed.
    Expired,
    /// HMAC verification failed.
    AuthFailed,
    /// The broker is draining and refuses new connections.
    Draining,
}

impl ErrorToken {
    /// The token string as it appears on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::UnknownAction => "unknown_action",
            Self::TooLarge => "too_large",
            Self::KeyAndWorkerRequired => "key_and_worker_required",
            Self::WorkerRequired => "worker_required",
            Self::TtlRequired => "ttl_required",
            Self::InvalidTtl => "invalid_ttl",
            Self::MaxItems => "max_items",
            Self::WorkerAlreadyHasLease => "worker_already_has_lease",
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AuthFailed => "auth_failed",
            Self::Draining => "draining",
        }
    }
}

impl std::fmt::Display for ErrorToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failures raised by the line codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The connection buffer exceeded the request size cap.
    ///
    /// The server answers `too_large` and closes the connection.
    #[error("frame exceeds {max} byte cap ({size} bytes buffered)")]
    FrameTooLarge {
        /// Bytes buffered when the cap tripped.
        size: usize,
        /// The configured cap.
        max: usize,
    },

    /// Underlying stream I/O failed.
    #[error("connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}
