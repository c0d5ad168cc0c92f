//! Shared broker state.
//!
//! One handle owns the mutable stores behind an async `RwLock` plus the
//! lock-free accounting the pipeline and lifecycle controller touch on
//! every request: in-flight count, last-activity stamp, draining flag, and
//! the request counter that doubles as the correlation-id suffix.
//!
//! Handlers take the write lock for the duration of one request, which
//! realises the single-writer discipline the stores assume.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::config::BrokerConfig;
use crate::lease::LeaseTable;
use crate::metrics::BrokerMetrics;
use crate::store::ValueStore;

/// Shared handle to broker state.
pub type SharedBroker = Arc<BrokerHandle>;

/// Lifecycle states. Forward-only; there is no way back to `Listening`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed, endpoint not yet bound.
    Fresh,
    /// Accepting connections.
    Listening,
    /// Refusing new connections, finishing in-flight work.
    Draining,
    /// Endpoint closed, state cleared.
    Stopped,
}

/// Wall-clock milliseconds since the Unix epoch.
///
/// TTL arithmetic is wall-clock on purpose: intervals are short and the
/// broker is ephemeral, so a monotonic/wall split buys nothing.
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// The mutable stores, guarded together so one writer sees both.
#[derive(Debug)]
pub struct BrokerStores {
    /// Value entries.
    pub values: ValueStore,
    /// Lease entries.
    pub leases: LeaseTable,
}

/// Handle to broker state with interior mutability.
pub struct BrokerHandle {
    stores: RwLock<BrokerStores>,
    config: BrokerConfig,
    metrics: BrokerMetrics,
    state: AtomicU64,
    in_flight: AtomicU64,
    last_activity_ms: AtomicU64,
    request_counter: AtomicU64,
    started_at_ms: u64,
    degraded: AtomicBool,
    signal_handlers_installed: AtomicBool,
}

impl BrokerHandle {
    /// Creates a handle from configuration; stores start empty.
    #[must_use]
    pub fn new(config: BrokerConfig, metrics: BrokerMetrics) -> SharedBroker {
        let started = now_ms();
        Arc::new(Self {
            stores: RwLock::new(BrokerStores {
                values: ValueStore::new(
                    config.default_ttl_ms,
                    config.require_ttl,
                    config.max_items,
                    config.max_value_size,
                ),
                leases: LeaseTable::new(config.default_ttl_ms),
            }),
            config,
            metrics,
            state: AtomicU64::new(LifecycleState::Fresh as u64),
            in_flight: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(started),
            request_counter: AtomicU64::new(0),
            started_at_ms: started,
            degraded: AtomicBool::new(false),
            signal_handlers_installed: AtomicBool::new(false),
        })
    }

    /// The configuration this broker runs with.
    #[must_use]
    pub const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The metrics registry.
    #[must_use]
    pub const fn metrics(&self) -> &BrokerMetrics {
        &self.metrics
    }

    /// Write access to the stores.
    pub async fn stores(&self) -> tokio::sync::RwLockWriteGuard<'_, BrokerStores> {
        self.stores.write().await
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        match self.state.load(Ordering::SeqCst) {
            0 => LifecycleState::Fresh,
            1 => LifecycleState::Listening,
            2 => LifecycleState::Draining,
            _ => LifecycleState::Stopped,
        }
    }

    /// Moves to a later lifecycle state; earlier states are never
    /// re-entered.
    pub fn advance_state(&self, next: LifecycleState) {
        self.state.fetch_max(next as u64, Ordering::SeqCst);
    }

    /// Whether new connections are being refused.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= LifecycleState::Draining as u64
    }

    /// Begins tracking one request: bumps in-flight, stamps activity, and
    /// hands out the correlation sequence number.
    pub fn begin_request(&self, now: u64) -> u64 {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.last_activity_ms.store(now, Ordering::SeqCst);
        self.metrics.request_received();
        self.request_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Ends tracking one request.
    pub fn end_request(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Requests currently being processed.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Total requests accepted since start.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.request_counter.load(Ordering::SeqCst)
    }

    /// Wall-clock stamp of the most recent request.
    #[must_use]
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::SeqCst)
    }

    /// Wall-clock start stamp.
    #[must_use]
    pub const fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    /// Uptime in milliseconds.
    #[must_use]
    pub fn uptime_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.started_at_ms)
    }

    /// Flips the degraded flag, returning `true` only on the crossing so
    /// callers can log once per transition.
    pub fn set_degraded(&self, degraded: bool) -> bool {
        self.degraded.swap(degraded, Ordering::SeqCst) != degraded
    }

    /// Marks signal handlers installed; `true` the first time only.
    pub fn mark_signal_handlers_installed(&self) -> bool {
        !self.signal_handlers_installed.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("state", &self.lifecycle_state())
            .field("in_flight", &self.in_flight())
            .field("requests", &self.request_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SharedBroker {
        BrokerHandle::new(BrokerConfig::default(), BrokerMetrics::new().unwrap())
    }

    #[test]
    fn lifecycle_is_forward_only() {
        let broker = handle();
        assert_eq!(broker.lifecycle_state(), LifecycleState::Fresh);

        broker.advance_state(LifecycleState::Listening);
        assert_eq!(broker.lifecycle_state(), LifecycleState::Listening);

        broker.advance_state(LifecycleState::Draining);
        broker.advance_state(LifecycleState::Listening);
        assert_eq!(broker.lifecycle_state(), LifecycleState::Draining);
        assert!(broker.is_draining());

        broker.advance_state(LifecycleState::Stopped);
        assert_eq!(broker.lifecycle_state(), LifecycleState::Stopped);
    }

    #[test]
    fn request_accounting_balances() {
        let broker = handle();
        let seq0 = broker.begin_request(1_000);
        let seq1 = broker.begin_request(1_001);
        assert_eq!(seq1, seq0 + 1);
        assert_eq!(broker.in_flight(), 2);
        assert_eq!(broker.last_activity_ms(), 1_001);

        broker.end_request();
        broker.end_request();
        assert_eq!(broker.in_flight(), 0);
        assert_eq!(broker.request_count(), 2);
    }

    #[test]
    fn degraded_reports_crossings_only() {
        let broker = handle();
        assert!(broker.set_degraded(true));
        assert!(!broker.set_degraded(true));
        assert!(broker.set_degraded(false));
        assert!(!broker.set_degraded(false));
    }

    #[test]
    fn signal_handler_guard_fires_once() {
        let broker = handle();
        assert!(broker.mark_signal_handlers_installed());
        assert!(!broker.mark_signal_handlers_installed());
    }
}
