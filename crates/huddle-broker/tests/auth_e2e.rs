//! HMAC authentication over a real socket.

mod common;

use common::TestBroker;
use huddle_broker::protocol::Authenticator;
use huddle_broker::BrokerConfig;
use serde_json::json;

const SECRET: &str = "wide-open-spaces";

fn secured_config() -> BrokerConfig {
    BrokerConfig {
        secret: Some(SECRET.to_string()),
        ..BrokerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signed_client_requests_succeed() {
    let broker = TestBroker::with_config(secured_config()).await;
    let client = broker.client().with_secret(SECRET);

    assert!(client.ping().unwrap() > 0);
    client.set("k", &json!("v"), Some(60_000)).unwrap();
    assert_eq!(client.get("k").unwrap(), json!("v"));

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsigned_requests_are_rejected() {
    let broker = TestBroker::with_config(secured_config()).await;

    let response = broker.raw_request(&json!({"action": "ping"})).await;
    assert_eq!(response["error"], "auth_failed");

    let client = broker.client();
    let err = client.ping().unwrap_err();
    assert_eq!(err.token(), Some("auth_failed"));

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flipped_bit_in_signature_is_rejected() {
    let broker = TestBroker::with_config(secured_config()).await;
    let auth = Authenticator::new(SECRET);

    let canonical = br#"{"action":"ping"}"#;
    let mut hmac = auth.sign(canonical);
    let flipped = if hmac.ends_with('0') { '1' } else { '0' };
    hmac.pop();
    hmac.push(flipped);

    let frame = format!("{{\"hmac\":\"{hmac}\",\"action\":\"ping\"}}\n");
    let response = broker.raw_request_bytes(frame.as_bytes()).await;
    assert_eq!(response["error"], "auth_failed");

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_hmacs_reject_without_crashing() {
    let broker = TestBroker::with_config(secured_config()).await;

    for hmac in [json!("zz"), json!(42), json!(null), json!(["not", "hex"])] {
        let response = broker
            .raw_request(&json!({"action": "ping", "hmac": hmac}))
            .await;
        assert_eq!(response["error"], "auth_failed", "hmac = {hmac}");
    }

    // The broker is still alive and serving signed traffic.
    let client = broker.client().with_secret(SECRET);
    assert!(client.ping().unwrap() > 0);

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_secret_is_rejected() {
    let broker = TestBroker::with_config(secured_config()).await;
    let client = broker.client().with_secret("some-other-secret");

    let err = client.ping().unwrap_err();
    assert_eq!(err.token(), Some("auth_failed"));

    broker.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secretless_broker_ignores_signatures() {
    let broker = TestBroker::start().await;
    // Signed traffic against an open broker still works: the hmac member
    // is just an ignored field.
    let client = broker.client().with_secret(SECRET);
    assert!(client.ping().unwrap() > 0);

    broker.shutdown().await;
}
