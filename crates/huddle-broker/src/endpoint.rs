//! Local stream endpoint management.
//!
//! The broker listens on a Unix domain socket under the system temp
//! directory, named `broker-<12 hex chars>.sock`. The module owns path
//! generation, the `sun_path` length check, owner-only permissions, stale
//! socket reclamation, and unlink-on-stop.
//!
//! # Stale sockets
//!
//! A previous broker that died without cleanup leaves its socket file
//! behind. Before failing a bind, [`Endpoint::bind`] probes the existing
//! path with a short connect timeout: a live peer means another broker owns
//! the path (`AlreadyRunning`); a dead one is unlinked and the path reused.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngCore;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;

/// Maximum byte length of a Unix socket path (`sun_path` on common
/// systems).
pub const MAX_SOCKET_PATH_LEN: usize = 107;

/// Timeout for the stale-socket probe connect.
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors raised while establishing the endpoint.
///
/// These are start-time failures surfaced to the caller of
/// `Broker::start`; they never appear on the wire.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The generated socket path exceeds the `sun_path` limit.
    #[error(
        "socket path {path:?} is {len} bytes, exceeding the {MAX_SOCKET_PATH_LEN}-byte limit; \
         set TMPDIR to a shorter directory"
    )]
    PathTooLong {
        /// The offending path.
        path: PathBuf,
        /// Its byte length.
        len: usize,
    },

    /// Another broker is already listening on the chosen path.
    #[error("a broker is already running at {path:?}")]
    AlreadyRunning {
        /// The contested path.
        path: PathBuf,
    },

    /// Binding or preparing the socket failed.
    #[error("failed to bind endpoint at {path:?}: {source}")]
    Bind {
        /// The path that could not be bound.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// A bound local endpoint.
///
/// Owns the socket path for its lifetime; [`Endpoint::unlink`] removes the
/// filesystem entry on stop.
#[derive(Debug)]
pub struct Endpoint {
    path: PathBuf,
    listener: Option<UnixListener>,
}

impl Endpoint {
    /// Generates a path, reclaims any stale socket, binds, and restricts
    /// the socket to owner-only access (0700).
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::PathTooLong`] when the temp directory
    /// produces a path over the `sun_path` limit,
    /// [`EndpointError::AlreadyRunning`] when a live broker holds the
    /// path, and [`EndpointError::Bind`] for other I/O failures.
    pub async fn bind(config: &BrokerConfig) -> Result<Self, EndpointError> {
        let path = endpoint_path(config.pipe_id.as_deref());

        let len = path.as_os_str().len();
        if len > MAX_SOCKET_PATH_LEN {
            return Err(EndpointError::PathTooLong { path, len });
        }

        if path.exists() {
            reclaim_stale(&path).await?;
        }

        let listener = UnixListener::bind(&path).map_err(|source| EndpointError::Bind {
            path: path.clone(),
            source,
        })?;

        set_owner_only(&path).map_err(|source| EndpointError::Bind {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "endpoint bound");
        Ok(Self {
            path,
            listener: Some(listener),
        })
    }

    /// The filesystem path of the socket.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes ownership of the listener for the accept loop.
    ///
    /// # Panics
    ///
    /// Panics if called twice; the server task is the sole consumer.
    #[must_use]
    pub fn take_listener(&mut self) -> UnixListener {
        self.listener.take().expect("listener already taken")
    }

    /// Removes the socket file. Safe to call repeatedly.
    pub fn unlink(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "endpoint unlinked"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to unlink endpoint"),
        }
    }
}

/// Builds the socket path: `<tmp>/broker-<suffix>.sock` with a random
/// 12-hex-char suffix unless one is pinned by configuration.
fn endpoint_path(pipe_id: Option<&str>) -> PathBuf {
    let suffix = pipe_id.map_or_else(random_suffix, str::to_string);
    std::env::temp_dir().join(format!("broker-{suffix}.sock"))
}

fn random_suffix() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Probes an existing socket file and unlinks it when nothing answers.
async fn reclaim_stale(path: &Path) -> Result<(), EndpointError> {
    let probe = tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(path)).await;
    match probe {
        Ok(Ok(_stream)) => Err(EndpointError::AlreadyRunning {
            path: path.to_path_buf(),
        }),
        // Refused, missing, or timed out: the socket is stale.
        Ok(Err(_)) | Err(_) => {
            warn!(path = %path.display(), "removing stale socket");
            std::fs::remove_file(path).map_err(|source| EndpointError::Bind {
                path: path.to_path_buf(),
                source,
            })
        },
    }
}

fn set_owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}
