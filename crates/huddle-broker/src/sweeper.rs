//! Periodic TTL sweeper.
//!
//! Walks the value store and the lease table on a configurable cadence,
//! evicting entries whose expiry has passed and feeding the expiry
//! counters. Each tick is a single bounded pass; correctness never depends
//! on the cadence because the lease allocator prunes eagerly and the value
//! store evicts expired entries on read.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::state::{now_ms, SharedBroker};

/// Spawns the sweeper task. The handle is aborted on stop.
pub fn spawn(broker: SharedBroker, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a fresh broker is
        // not swept at startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            sweep_once(&broker).await;
        }
    })
}

/// One sweep pass over both tables.
pub async fn sweep_once(broker: &SharedBroker) {
    let now = now_ms();
    let mut stores = broker.stores().await;
    let expired_items = stores.values.sweep(now);
    let expired_leases = stores.leases.sweep(now);
    drop(stores);

    if expired_items > 0 {
        broker.metrics().items_expired(expired_items);
    }
    if expired_leases > 0 {
        broker.metrics().leases_expired(expired_leases);
    }
    if expired_items > 0 || expired_leases > 0 {
        debug!(expired_items, expired_leases, "sweep evicted expired entries");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::BrokerConfig;
    use crate::metrics::{BrokerMetrics, MetricsSnapshot};
    use crate::state::BrokerHandle;

    #[tokio::test]
    async fn sweep_evicts_and_counts_both_tables() {
        let broker = BrokerHandle::new(BrokerConfig::default(), BrokerMetrics::new().unwrap());
        let now = now_ms();
        {
            let mut stores = broker.stores().await;
            stores
                .values
                .set("short", json!("v"), Some(1), false, now.saturating_sub(100))
                .unwrap();
            stores
                .values
                .set("long", json!("v"), Some(600_000), false, now)
                .unwrap();
            stores
                .leases
                .lease("p", "w", Some(1), now.saturating_sub(100))
                .unwrap();
        }

        sweep_once(&broker).await;

        let mut stores = broker.stores().await;
        assert_eq!(stores.values.live_count(now), 1);
        assert_eq!(stores.leases.live_count(now), 0);
        assert!(!stores.values.del("short"));
        drop(stores);

        let text = broker
            .metrics()
            .encode_text(&MetricsSnapshot::default())
            .unwrap();
        assert!(text.contains("broker_items_expired_total 1"));
        assert!(text.contains("broker_leases_expired_total 1"));
    }

    #[tokio::test]
    async fn periodic_task_sweeps_on_cadence() {
        let broker = BrokerHandle::new(BrokerConfig::default(), BrokerMetrics::new().unwrap());
        let now = now_ms();
        {
            let mut stores = broker.stores().await;
            stores
                .values
                .set("gone", json!("v"), Some(5), false, now)
                .unwrap();
        }

        let task = spawn(broker.clone(), Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;
        task.abort();

        let mut stores = broker.stores().await;
        assert!(!stores.values.del("gone"));
    }
}
