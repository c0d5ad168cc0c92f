//! Request pipeline: accounting, authentication, and action dispatch.
//!
//! For every accepted frame the pipeline bumps the in-flight gauge and
//! activity stamp, mints a correlation ID for log events, verifies the
//! signature when a secret is configured, and routes on the `action`
//! string. Handlers always produce a response object; nothing here raises
//! to the transport.
//!
//! The correlation ID is a wall-clock-millisecond prefix with a
//! process-monotonic suffix. It appears in log events only, never on the
//! wire.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::lease::LeaseError;
use crate::metrics::{utilization, MetricsSnapshot};
use crate::state::{now_ms, SharedBroker};
use crate::store::{GetOutcome, SetError};
use crate::telemetry::memory_reading;

use super::auth::Authenticator;
use super::error::ErrorToken;
use super::wire::{error_response, ok_response, to_frame, Request};

/// Utilisation at or above which health reports `near_capacity`.
const NEAR_CAPACITY_THRESHOLD: f64 = 0.90;

/// The request pipeline for one broker.
#[derive(Debug, Clone)]
pub struct Pipeline {
    broker: SharedBroker,
    auth: Option<Authenticator>,
}

impl Pipeline {
    /// Builds the pipeline; authentication is enabled iff the broker
    /// configuration carries a secret.
    #[must_use]
    pub fn new(broker: SharedBroker) -> Self {
        let auth = broker
            .config()
            .secret
            .as_deref()
            .map(Authenticator::new);
        Self { broker, auth }
    }

    /// Processes one raw frame into one response frame (terminator
    /// excluded).
    pub async fn process(&self, raw: &[u8]) -> Vec<u8> {
        let now = now_ms();
        let seq = self.broker.begin_request(now);
        let correlation_id = format!("{now}-{seq}");

        let response = self.handle(raw, now, &correlation_id).await;
        self.broker.end_request();
        to_frame(&response)
    }

    async fn handle(&self, raw: &[u8], now: u64, correlation_id: &str) -> Value {
        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(error) => {
                debug!(correlation_id, %error, "frame is not valid JSON");
                return error_response(ErrorToken::InvalidJson);
            },
        };

        if let Some(auth) = &self.auth {
            if !auth.verify(raw, request.hmac.as_ref()) {
                warn!(correlation_id, "request failed authentication");
                return error_response(ErrorToken::AuthFailed);
            }
        }

        let Some(action) = request.action.clone() else {
            debug!(correlation_id, "frame carries no action");
            return error_response(ErrorToken::UnknownAction);
        };

        let response = match action.as_str() {
            "get" => self.handle_get(&request, now).await,
            "set" => self.handle_set(&request, now).await,
            "del" => self.handle_del(&request).await,
            "list" => self.handle_list(now).await,
            "ping" => json!({ "ok": true, "pong": now }),
            "stats" => self.handle_stats(now).await,
            "health" => self.handle_health(now).await,
            "metrics" => self.handle_metrics(now).await,
            "lease" => self.handle_lease(&request, now).await,
            "release" => self.handle_release(&request).await,
            _ => {
                debug!(correlation_id, action, "unknown action");
                return error_response(ErrorToken::UnknownAction);
            },
        };

        let ok = response["ok"].as_bool().unwrap_or(false);
        self.broker.metrics().operation(&action, ok);
        debug!(correlation_id, action, ok, "request handled");
        response
    }

    async fn handle_get(&self, request: &Request, now: u64) -> Value {
        let key = request.key.as_deref().unwrap_or_default();
        let mut stores = self.broker.stores().await;
        match stores.values.get(key, now) {
            GetOutcome::Found { value, compressed } => {
                json!({ "ok": true, "value": value, "compressed": compressed })
            },
            GetOutcome::Expired => error_response(ErrorToken::Expired),
            GetOutcome::NotFound => error_response(ErrorToken::NotFound),
        }
    }

    async fn handle_set(&self, request: &Request, now: u64) -> Value {
        let key = request.key.as_deref().unwrap_or_default();
        let value = request.value.clone().unwrap_or(Value::Null);
        let compressed = request.compressed.unwrap_or(false);

        let mut stores = self.broker.stores().await;
        match stores.values.set(key, value, request.ttl, compressed, now) {
            Ok(()) => {
                match (compressed, request.before_size, request.after_size) {
                    (true, Some(before), Some(after)) => {
                        self.broker.metrics().compressed_write(before, after);
                    },
                    _ => self.broker.metrics().uncompressed_write(),
                }
                ok_response()
            },
            Err(SetError::TtlRequired) => error_response(ErrorToken::TtlRequired),
            Err(SetError::InvalidTtl) => error_response(ErrorToken::InvalidTtl),
            Err(SetError::TooLarge) => error_response(ErrorToken::TooLarge),
            Err(SetError::MaxItems) => error_response(ErrorToken::MaxItems),
        }
    }

    async fn handle_del(&self, request: &Request) -> Value {
        let key = request.key.as_deref().unwrap_or_default();
        let mut stores = self.broker.stores().await;
        // Deleting an absent key is still ok; presence is not reported.
        let _present = stores.values.del(key);
        ok_response()
    }

    async fn handle_list(&self, now: u64) -> Value {
        let stores = self.broker.stores().await;
        let mut items = Map::new();
        for (key, expires_at) in stores.values.list(now) {
            items.insert(
                key.to_string(),
                json!({ "expires": expires_at, "hasValue": true }),
            );
        }
        json!({ "ok": true, "items": items })
    }

    async fn handle_lease(&self, request: &Request, now: u64) -> Value {
        let pool_key = request.key.as_deref().unwrap_or_default();
        let worker_id = request.worker_id.as_deref().unwrap_or_default();

        let mut stores = self.broker.stores().await;
        match stores.leases.lease(pool_key, worker_id, request.ttl, now) {
            Ok(value) => json!({ "ok": true, "value": value }),
            Err(LeaseError::KeyAndWorkerRequired) => {
                error_response(ErrorToken::KeyAndWorkerRequired)
            },
            Err(LeaseError::WorkerAlreadyHasLease) => {
                error_response(ErrorToken::WorkerAlreadyHasLease)
            },
        }
    }

    async fn handle_release(&self, request: &Request) -> Value {
        let Some(worker_id) = request.worker_id.as_deref().filter(|w| !w.is_empty()) else {
            return error_response(ErrorToken::WorkerRequired);
        };

        let mut stores = self.broker.stores().await;
        let released = stores.leases.release(worker_id);
        json!({ "ok": true, "released": released })
    }

    async fn handle_stats(&self, now: u64) -> Value {
        let stores = self.broker.stores().await;
        let items = stores.values.live_count(now);
        let leases = stores.leases.live_count(now);
        let approx_store_bytes = stores.values.approx_bytes(now);
        let max_items = stores.values.max_items();
        drop(stores);

        let config = self.broker.config();
        json!({
            "ok": true,
            "stats": {
                "items": items,
                "leases": leases,
                "approxStoreBytes": approx_store_bytes,
                "capacity": capacity_block(items, max_items),
                "memory": memory_reading(),
                "uptimeMs": self.broker.uptime_ms(now),
                "requests": self.broker.request_count(),
                "compression": {
                    "enabled": config.compression,
                    "threshold": config.compression_threshold,
                },
            },
        })
    }

    async fn handle_health(&self, now: u64) -> Value {
        let stores = self.broker.stores().await;
        let items = stores.values.live_count(now);
        let max_items = stores.values.max_items();
        drop(stores);

        let at_capacity = max_items > 0 && utilization(items, max_items) >= 1.0;
        if at_capacity {
            if self.broker.set_degraded(true) {
                warn!(items, max_items, "store at capacity, health degraded");
            }
        } else {
            self.broker.set_degraded(false);
        }

        json!({
            "ok": true,
            "status": if at_capacity { "degraded" } else { "healthy" },
            "uptimeMs": self.broker.uptime_ms(now),
            "timestamp": now,
            "capacity": capacity_block(items, max_items),
            "memory": memory_reading(),
            "inFlight": self.broker.in_flight(),
            "draining": self.broker.is_draining(),
        })
    }

    async fn handle_metrics(&self, now: u64) -> Value {
        let stores = self.broker.stores().await;
        let items = stores.values.live_count(now);
        let max_items = stores.values.max_items();
        drop(stores);

        let snapshot = MetricsSnapshot {
            in_flight: self.broker.in_flight(),
            draining: self.broker.is_draining(),
            items,
            max_items,
        };
        match self.broker.metrics().encode_text(&snapshot) {
            Ok(text) => json!({ "ok": true, "metrics": text, "format": "prometheus" }),
            Err(error) => {
                warn!(%error, "metrics encoding failed");
                json!({ "ok": false, "error": "metrics_unavailable" })
            },
        }
    }
}

/// The capacity assessment shared by `stats` and `health`.
fn capacity_block(items: usize, max_items: usize) -> Value {
    let utilization = utilization(items, max_items);
    let near_capacity = max_items > 0 && utilization >= NEAR_CAPACITY_THRESHOLD;
    let at_capacity = max_items > 0 && utilization >= 1.0;
    let warning = if at_capacity {
        "at_capacity"
    } else if near_capacity {
        "near_capacity"
    } else {
        "none"
    };

    json!({
        "items": items,
        "maxItems": max_items,
        "utilization": utilization,
        "nearCapacity": near_capacity,
        "atCapacity": at_capacity,
        "warning": warning,
    })
}
