//! Broker configuration.
//!
//! Every option is read from a `BROKER_<UPPER_SNAKE>` environment variable
//! with a built-in default, and may be overridden programmatically (tests)
//! or from the command line (the binary). Durations are milliseconds;
//! booleans accept `1`/`true`/`yes`/`on` case-insensitively.
//!
//! An unparseable value falls back to the default with a warning event
//! rather than aborting startup: the broker is typically launched by a test
//! harness where a typo'd variable should degrade, not kill the run.

use std::time::Duration;

use tracing::warn;

/// TTL applied when a `set` omits one and [`BrokerConfig::require_ttl`] is
/// off (30 minutes).
pub const DEFAULT_TTL_MS: u64 = 1_800_000;

/// Default cap on non-expired value entries.
pub const DEFAULT_MAX_ITEMS: usize = 10_000;

/// Default per-connection request buffer cap (1 MiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1_048_576;

/// Default per-value size cap (256 KiB).
pub const DEFAULT_MAX_VALUE_SIZE: usize = 262_144;

/// Default sweeper cadence (30 s).
pub const DEFAULT_SWEEPER_INTERVAL_MS: u64 = 30_000;

/// Default drain timeout (5 s).
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Advisory compression threshold echoed to clients (bytes).
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1_024;

/// Environment variable through which the endpoint path is exported to
/// child processes.
pub const ENDPOINT_ENV_VAR: &str = "BROKER_ENDPOINT";

/// Environment variable conveying the shared HMAC secret to co-operating
/// clients.
pub const SECRET_ENV_VAR: &str = "BROKER_SECRET";

/// Runtime configuration for a broker instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TTL used when a `set` omits one and `require_ttl` is off.
    pub default_ttl_ms: u64,
    /// Reject `set` requests without a positive TTL.
    pub require_ttl: bool,
    /// Cap on non-expired value entries; `0` disables the cap.
    pub max_items: usize,
    /// Per-connection request buffer cap in bytes.
    pub max_request_size: usize,
    /// Per-value size cap in bytes.
    pub max_value_size: usize,
    /// Shared HMAC secret; authentication is enabled when set.
    pub secret: Option<String>,
    /// Sweeper cadence.
    pub sweeper_interval: Duration,
    /// Shut down after this much inactivity; disabled when `None`.
    pub idle_timeout: Option<Duration>,
    /// Emit a heartbeat event at this cadence; disabled when `None`.
    pub heartbeat_interval: Option<Duration>,
    /// Severity threshold for the log subscriber.
    pub log_level: String,
    /// Emit JSON log events rather than human lines.
    pub structured_logging: bool,
    /// Advisory compression flag echoed to clients.
    pub compression: bool,
    /// Advisory compression threshold echoed to clients, in bytes.
    pub compression_threshold: usize,
    /// Override for the random endpoint path suffix.
    pub pipe_id: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: DEFAULT_TTL_MS,
            require_ttl: true,
            max_items: DEFAULT_MAX_ITEMS,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            secret: None,
            sweeper_interval: Duration::from_millis(DEFAULT_SWEEPER_INTERVAL_MS),
            idle_timeout: None,
            heartbeat_interval: None,
            log_level: "info".to_string(),
            structured_logging: false,
            compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            pipe_id: None,
        }
    }
}

impl BrokerConfig {
    /// Loads configuration from `BROKER_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary variable lookup.
    ///
    /// This is the testable seam: tests pass a closure over a map instead
    /// of mutating process-global environment state.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            default_ttl_ms: parse_or(&lookup, "BROKER_DEFAULT_TTL", defaults.default_ttl_ms),
            require_ttl: parse_bool_or(&lookup, "BROKER_REQUIRE_TTL", defaults.require_ttl),
            max_items: parse_or(&lookup, "BROKER_MAX_ITEMS", defaults.max_items),
            max_request_size: parse_or(
                &lookup,
                "BROKER_MAX_REQUEST_SIZE",
                defaults.max_request_size,
            ),
            max_value_size: parse_or(&lookup, "BROKER_MAX_VALUE_SIZE", defaults.max_value_size),
            secret: lookup("BROKER_SECRET").filter(|s| !s.is_empty()),
            sweeper_interval: Duration::from_millis(parse_or(
                &lookup,
                "BROKER_SWEEPER_INTERVAL",
                DEFAULT_SWEEPER_INTERVAL_MS,
            )),
            idle_timeout: parse_opt_ms(&lookup, "BROKER_IDLE_TIMEOUT"),
            heartbeat_interval: parse_opt_ms(&lookup, "BROKER_HEARTBEAT_INTERVAL"),
            log_level: lookup("BROKER_LOG_LEVEL").unwrap_or(defaults.log_level),
            structured_logging: parse_bool_or(
                &lookup,
                "BROKER_STRUCTURED_LOGGING",
                defaults.structured_logging,
            ),
            compression: parse_bool_or(&lookup, "BROKER_COMPRESSION", defaults.compression),
            compression_threshold: parse_or(
                &lookup,
                "BROKER_COMPRESSION_THRESHOLD",
                defaults.compression_threshold,
            ),
            pipe_id: lookup("BROKER_PIPE_ID").filter(|s| !s.is_empty()),
        }
    }

    /// Drain timeout used by the signal and idle shutdown paths.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr + Copy,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable configuration value, using default");
            default
        }),
    }
}

fn parse_bool_or<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                warn!(key, value = %raw, "unparseable boolean, using default");
                default
            },
        },
    }
}

fn parse_opt_ms<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.parse::<u64>() {
        Ok(0) => None,
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(key, value = %raw, "unparseable duration, leaving disabled");
            None
        },
    }
}
