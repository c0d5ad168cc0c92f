//! Test harness: boots a broker on a private socket and hands out
//! clients.
//!
//! Each `TestBroker` gets a unique pipe id (process id plus a counter) so
//! parallel tests never contend for a socket path. The raw line client
//! speaks the wire protocol directly for tests that need to send exact
//! bytes; the library client exercises the full client stack.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use huddle_broker::{Broker, BrokerConfig};
use huddle_client::BrokerClient;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

static NEXT_PIPE: AtomicU32 = AtomicU32::new(0);

/// A broker running inside the test process.
pub struct TestBroker {
    broker: Broker,
}

#[allow(dead_code)] // Not every test file uses every helper.
impl TestBroker {
    /// Starts a broker with defaults.
    pub async fn start() -> Self {
        Self::with_config(BrokerConfig::default()).await
    }

    /// Starts a broker with the given configuration; the pipe id is
    /// always replaced with a unique one.
    pub async fn with_config(mut config: BrokerConfig) -> Self {
        let seq = NEXT_PIPE.fetch_add(1, Ordering::SeqCst);
        config.pipe_id = Some(format!("{:x}{seq:04x}", std::process::id()));
        let broker = Broker::start(config).await.expect("broker should start");
        Self { broker }
    }

    /// The running broker, for drain/stop calls.
    pub fn broker_mut(&mut self) -> &mut Broker {
        &mut self.broker
    }

    /// The broker's shared state handle.
    pub fn handle(&self) -> &huddle_broker::SharedBroker {
        self.broker.handle()
    }

    /// A library client pointed at this broker.
    pub fn client(&self) -> BrokerClient {
        BrokerClient::new(self.broker.endpoint_path())
            .with_timeout(Duration::from_secs(2))
    }

    /// Opens a raw connection.
    pub async fn connect(&self) -> UnixStream {
        UnixStream::connect(self.broker.endpoint_path())
            .await
            .expect("connect should succeed")
    }

    /// Sends one frame over a fresh connection and reads one response.
    pub async fn raw_request(&self, frame: &Value) -> Value {
        let mut stream = self.connect().await;
        let mut line = serde_json::to_vec(frame).unwrap();
        line.push(b'\n');
        stream.write_all(&line).await.unwrap();
        read_response(&mut stream).await
    }

    /// Sends raw bytes (terminator included) and reads one response.
    pub async fn raw_request_bytes(&self, bytes: &[u8]) -> Value {
        let mut stream = self.connect().await;
        stream.write_all(bytes).await.unwrap();
        read_response(&mut stream).await
    }

    /// Stops the broker and removes its socket.
    pub async fn shutdown(mut self) {
        self.broker.stop().await;
    }
}

/// Reads one response line from a raw connection.
#[allow(dead_code)]
pub async fn read_response(stream: &mut UnixStream) -> Value {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .expect("response read should succeed");
    serde_json::from_str(&line).expect("response should be JSON")
}
