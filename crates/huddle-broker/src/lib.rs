//! huddle-broker — ephemeral key/value and lease broker.
//!
//! The broker lets a parent process and its descendants (typically
//! parallel test workers) share short-lived state — tokens, session
//! identifiers, coordination counters — over a local Unix socket. Nothing
//! touches disk and no network port opens; the broker lives exactly as
//! long as the workload that spawned it.
//!
//! # Modules
//!
//! - [`endpoint`]: socket path generation, permissions, stale reclamation
//! - [`protocol`]: newline-JSON framing, HMAC authentication, dispatch
//! - [`store`]: TTL'd value entries with size and capacity discipline
//! - [`lease`]: dense integer allocation for parallel workers
//! - [`sweeper`]: periodic TTL eviction
//! - [`lifecycle`]: start/drain/stop, signals, idle watchdog, heartbeat,
//!   child supervision
//! - [`metrics`]: Prometheus counter/gauge families and text exposition
//! - [`telemetry`]: process memory readings for stats and health
//!
//! # Quick start
//!
//! ```ignore
//! use huddle_broker::{Broker, BrokerConfig};
//!
//! let mut broker = Broker::start(BrokerConfig::from_env()).await?;
//! let reason = broker.wait_for_shutdown().await;
//! broker.drain(broker.handle().config().drain_timeout()).await;
//! broker.stop().await;
//! std::process::exit(reason.exit_code());
//! ```

pub mod config;
pub mod endpoint;
pub mod lease;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod state;
pub mod store;
pub mod sweeper;
pub mod telemetry;

pub use config::BrokerConfig;
pub use endpoint::{Endpoint, EndpointError};
pub use lease::{LeaseError, LeaseTable};
pub use lifecycle::{Broker, DrainOutcome, ShutdownReason, StartError};
pub use metrics::BrokerMetrics;
pub use state::{BrokerHandle, LifecycleState, SharedBroker};
pub use store::{GetOutcome, SetError, ValueStore};
