//! Prometheus metrics for the broker.
//!
//! # Metric families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `broker_operations_total` | Counter | `action`, `result` |
//! | `broker_compression_total` | Counter | `compressed` |
//! | `broker_compression_bytes_before_total` | Counter | — |
//! | `broker_compression_bytes_after_total` | Counter | — |
//! | `broker_compression_ratio` | Gauge | — |
//! | `broker_items_expired_total` | Counter | — |
//! | `broker_leases_expired_total` | Counter | — |
//! | `broker_requests_total` | Counter | — |
//! | `broker_requests_in_flight` | Gauge | — |
//! | `broker_draining` | Gauge | — |
//! | `broker_capacity_items` | Gauge | — |
//! | `broker_capacity_max_items` | Gauge | — |
//! | `broker_capacity_utilization` | Gauge | — |
//!
//! Success and error are separate `result` label values; their sum is the
//! total for an action. Point-in-time gauges (in-flight, draining,
//! capacity) are set from a [`MetricsSnapshot`] at encode time so the
//! exposition always reflects the instant of the scrape.

use prometheus::{
    CounterVec, Encoder, Gauge, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use thiserror::Error;

/// Maximum length for label values; longer action strings are truncated so
/// a hostile client cannot mint unbounded label sets.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric with the registry.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode the exposition text.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Point-in-time values stamped into gauges at encode time.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    /// Requests currently in flight.
    pub in_flight: u64,
    /// Whether the broker is draining.
    pub draining: bool,
    /// Non-expired value entries.
    pub items: usize,
    /// Configured item cap (zero when disabled).
    pub max_items: usize,
}

/// Broker metrics registered against one Prometheus registry.
///
/// All metrics use interior mutability; the struct is `Clone`, `Send`, and
/// `Sync`.
#[derive(Clone)]
pub struct BrokerMetrics {
    registry: Registry,
    operations_total: CounterVec,
    compression_total: CounterVec,
    compression_bytes_before: IntCounter,
    compression_bytes_after: IntCounter,
    compression_ratio: Gauge,
    items_expired_total: IntCounter,
    leases_expired_total: IntCounter,
    requests_total: IntCounter,
    requests_in_flight: IntGauge,
    draining: IntGauge,
    capacity_items: IntGauge,
    capacity_max_items: IntGauge,
    capacity_utilization: Gauge,
}

impl BrokerMetrics {
    /// Creates the metric families and registers them.
    ///
    /// # Errors
    ///
    /// Returns an error if any family fails to register.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let operations_total = CounterVec::new(
            Opts::new("broker_operations_total", "Operations by action and result"),
            &["action", "result"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let compression_total = CounterVec::new(
            Opts::new("broker_compression_total", "Value writes by compression"),
            &["compressed"],
        )?;
        registry.register(Box::new(compression_total.clone()))?;

        let compression_bytes_before = IntCounter::new(
            "broker_compression_bytes_before_total",
            "Cumulative pre-compression bytes reported by clients",
        )?;
        registry.register(Box::new(compression_bytes_before.clone()))?;

        let compression_bytes_after = IntCounter::new(
            "broker_compression_bytes_after_total",
            "Cumulative post-compression bytes reported by clients",
        )?;
        registry.register(Box::new(compression_bytes_after.clone()))?;

        let compression_ratio = Gauge::new(
            "broker_compression_ratio",
            "Current cumulative compression ratio (after/before)",
        )?;
        registry.register(Box::new(compression_ratio.clone()))?;

        let items_expired_total =
            IntCounter::new("broker_items_expired_total", "Values evicted by TTL")?;
        registry.register(Box::new(items_expired_total.clone()))?;

        let leases_expired_total =
            IntCounter::new("broker_leases_expired_total", "Leases evicted by TTL")?;
        registry.register(Box::new(leases_expired_total.clone()))?;

        let requests_total = IntCounter::new("broker_requests_total", "Frames accepted")?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_in_flight =
            IntGauge::new("broker_requests_in_flight", "Requests being processed")?;
        registry.register(Box::new(requests_in_flight.clone()))?;

        let draining = IntGauge::new("broker_draining", "1 while the broker is draining")?;
        registry.register(Box::new(draining.clone()))?;

        let capacity_items = IntGauge::new("broker_capacity_items", "Non-expired value entries")?;
        registry.register(Box::new(capacity_items.clone()))?;

        let capacity_max_items =
            IntGauge::new("broker_capacity_max_items", "Configured item cap")?;
        registry.register(Box::new(capacity_max_items.clone()))?;

        let capacity_utilization = Gauge::new(
            "broker_capacity_utilization",
            "Non-expired entries over the item cap",
        )?;
        registry.register(Box::new(capacity_utilization.clone()))?;

        Ok(Self {
            registry,
            operations_total,
            compression_total,
            compression_bytes_before,
            compression_bytes_after,
            compression_ratio,
            items_expired_total,
            leases_expired_total,
            requests_total,
            requests_in_flight,
            draining,
            capacity_items,
            capacity_max_items,
            capacity_utilization,
        })
    }

    /// Records one dispatched operation.
    pub fn operation(&self, action: &str, ok: bool) {
        let action = truncate_label(action);
        let result = if ok { "success" } else { "error" };
        self.operations_total
            .with_label_values(&[action, result])
            .inc();
    }

    /// Records a compressed write with the client's size hints.
    pub fn compressed_write(&self, before: u64, after: u64) {
        self.compression_total.with_label_values(&["true"]).inc();
        self.compression_bytes_before.inc_by(before);
        self.compression_bytes_after.inc_by(after);

        let total_before = self.compression_bytes_before.get();
        if total_before > 0 {
            #[allow(clippy::cast_precision_loss)]
            self.compression_ratio
                .set(self.compression_bytes_after.get() as f64 / total_before as f64);
        }
    }

    /// Records an uncompressed write.
    pub fn uncompressed_write(&self) {
        self.compression_total.with_label_values(&["false"]).inc();
    }

    /// Records values evicted by TTL.
    pub fn items_expired(&self, count: u64) {
        self.items_expired_total.inc_by(count);
    }

    /// Records leases evicted by TTL.
    pub fn leases_expired(&self, count: u64) {
        self.leases_expired_total.inc_by(count);
    }

    /// Records one accepted frame.
    pub fn request_received(&self) {
        self.requests_total.inc();
    }

    /// Encodes the exposition text, stamping point-in-time gauges first.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self, snapshot: &MetricsSnapshot) -> Result<String, MetricsError> {
        #[allow(clippy::cast_possible_wrap)]
        {
            self.requests_in_flight.set(snapshot.in_flight as i64);
            self.draining.set(i64::from(snapshot.draining));
            self.capacity_items.set(snapshot.items as i64);
            self.capacity_max_items.set(snapshot.max_items as i64);
        }
        self.capacity_utilization.set(utilization(snapshot.items, snapshot.max_items));

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }

    /// Operation count for an action/result pair; test support.
    #[must_use]
    pub fn operation_count(&self, action: &str, ok: bool) -> f64 {
        let result = if ok { "success" } else { "error" };
        self.operations_total
            .with_label_values(&[truncate_label(action), result])
            .get()
    }
}

/// Fraction of the cap in use; zero when the cap is disabled.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn utilization(items: usize, max_items: usize) -> f64 {
    if max_items == 0 {
        0.0
    } else {
        items as f64 / max_items as f64
    }
}

/// Truncates a label value at a UTF-8 boundary so hostile action strings
/// cannot grow the label set or panic the encoder.
fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        value
    } else {
        let end = value
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_LABEL_VALUE_LEN)
            .last()
            .unwrap_or(0);
        &value[..end]
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)] // counters return exact integer values as f64
mod tests {
    use super::*;

    #[test]
    fn operations_split_by_result() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics.operation("set", true);
        metrics.operation("set", true);
        metrics.operation("set", false);

        assert_eq!(metrics.operation_count("set", true), 2.0);
        assert_eq!(metrics.operation_count("set", false), 1.0);
    }

    #[test]
    fn compression_ratio_tracks_cumulative_totals() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics.compressed_write(1_000, 250);
        metrics.compressed_write(1_000, 250);
        metrics.uncompressed_write();

        let text = metrics.encode_text(&MetricsSnapshot::default()).unwrap();
        assert!(text.contains("broker_compression_bytes_before_total 2000"));
        assert!(text.contains("broker_compression_bytes_after_total 500"));
        assert!(text.contains("broker_compression_ratio 0.25"));
        assert!(text.contains("broker_compression_total{compressed=\"false\"} 1"));
        assert!(text.contains("broker_compression_total{compressed=\"true\"} 2"));
    }

    #[test]
    fn snapshot_gauges_reflect_encode_time_state() {
        let metrics = BrokerMetrics::new().unwrap();
        let text = metrics
            .encode_text(&MetricsSnapshot {
                in_flight: 3,
                draining: true,
                items: 9,
                max_items: 10,
            })
            .unwrap();

        assert!(text.contains("broker_requests_in_flight 3"));
        assert!(text.contains("broker_draining 1"));
        assert!(text.contains("broker_capacity_items 9"));
        assert!(text.contains("broker_capacity_max_items 10"));
        assert!(text.contains("broker_capacity_utilization 0.9"));
    }

    #[test]
    fn expiry_counters_accumulate() {
        let metrics = BrokerMetrics::new().unwrap();
        metrics.items_expired(4);
        metrics.leases_expired(2);
        metrics.items_expired(1);

        let text = metrics.encode_text(&MetricsSnapshot::default()).unwrap();
        assert!(text.contains("broker_items_expired_total 5"));
        assert!(text.contains("broker_leases_expired_total 2"));
    }

    #[test]
    fn utilization_handles_disabled_cap() {
        assert_eq!(utilization(50, 0), 0.0);
        assert_eq!(utilization(5, 10), 0.5);
        assert!(utilization(12, 10) > 1.0);
    }

    #[test]
    fn hostile_action_labels_are_truncated() {
        let metrics = BrokerMetrics::new().unwrap();
        let long = "a".repeat(500);
        metrics.operation(&long, false);
        assert!(metrics.encode_text(&MetricsSnapshot::default()).is_ok());
    }
}
