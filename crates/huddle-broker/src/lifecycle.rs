//! Broker lifecycle: start, drain, stop, signals, and child supervision.
//!
//! States progress forward only: `Fresh → Listening → Draining → Stopped`.
//! `start` binds the endpoint, spawns the server and timer tasks, installs
//! signal handlers (idempotently), and exports the endpoint path so child
//! processes can discover it. `drain` flips the refuse-new-connections
//! flag and waits for in-flight work; `stop` tears everything down and
//! clears both stores.
//!
//! On `INT`/`TERM` the signal task forwards the same signal to a
//! supervised child (when one exists), waits briefly for it, and requests
//! shutdown; the owner then runs drain-then-stop and exits 0. A supervised
//! child exiting on its own triggers the same sequence with the child's
//! exit code.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, ENDPOINT_ENV_VAR, SECRET_ENV_VAR};
use crate::endpoint::{Endpoint, EndpointError};
use crate::metrics::{BrokerMetrics, MetricsError};
use crate::server;
use crate::state::{now_ms, BrokerHandle, LifecycleState, SharedBroker};
use crate::sweeper;
use crate::telemetry::memory_reading;

/// Cadence of the drain poll over `in_flight`.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Upper bound on the idle-watchdog check cadence.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// How long the signal path waits for a forwarded signal to take effect.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Start-time failures. These abort startup; they never reach the wire.
#[derive(Debug, Error)]
pub enum StartError {
    /// The endpoint could not be established.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    /// The metrics registry could not be built.
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Why the broker is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `SIGINT` or `SIGTERM` arrived.
    Signal,
    /// The idle watchdog tripped.
    Idle,
    /// The supervised child exited with this code.
    ChildExited(i32),
}

impl ShutdownReason {
    /// Process exit code mandated by this reason: a forwarded signal exits
    /// zero, a supervised child propagates its own code.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Signal | Self::Idle => 0,
            Self::ChildExited(code) => code,
        }
    }
}

/// Result of a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// In-flight work reached zero.
    Drained,
    /// The timeout elapsed with requests still counted; proceed to stop
    /// anyway.
    TimedOut,
}

/// A running broker.
pub struct Broker {
    handle: SharedBroker,
    endpoint: Endpoint,
    shutdown_tx: watch::Sender<bool>,
    reason_tx: watch::Sender<Option<ShutdownReason>>,
    reason_rx: watch::Receiver<Option<ShutdownReason>>,
    tasks: Vec<JoinHandle<()>>,
    child_pid: Arc<AtomicI32>,
}

impl Broker {
    /// Binds the endpoint and brings the broker to `Listening`.
    ///
    /// Spawns the accept loop, the sweeper, and (when configured) the idle
    /// watchdog and heartbeat tasks; installs signal handlers; exports the
    /// endpoint path (and secret, when set) into the environment for
    /// descendants.
    ///
    /// # Errors
    ///
    /// Returns [`StartError`] when the endpoint cannot be established or
    /// the metrics registry fails to build.
    pub async fn start(config: BrokerConfig) -> Result<Self, StartError> {
        let metrics = BrokerMetrics::new()?;
        let handle = BrokerHandle::new(config.clone(), metrics);
        let mut endpoint = Endpoint::bind(&config).await?;

        std::env::set_var(ENDPOINT_ENV_VAR, endpoint.path());
        if let Some(secret) = &config.secret {
            std::env::set_var(SECRET_ENV_VAR, secret);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (reason_tx, reason_rx) = watch::channel(None);
        let child_pid = Arc::new(AtomicI32::new(0));

        let mut tasks = Vec::new();
        tasks.push(server::spawn(
            handle.clone(),
            endpoint.take_listener(),
            shutdown_rx,
        ));
        tasks.push(sweeper::spawn(handle.clone(), config.sweeper_interval));

        if let Some(idle_timeout) = config.idle_timeout {
            tasks.push(spawn_idle_watchdog(
                handle.clone(),
                idle_timeout,
                reason_tx.clone(),
            ));
        }
        if let Some(interval) = config.heartbeat_interval {
            tasks.push(spawn_heartbeat(handle.clone(), interval));
        }

        if handle.mark_signal_handlers_installed() {
            tasks.push(spawn_signal_task(reason_tx.clone(), child_pid.clone()));
        } else {
            debug!("signal handlers already installed, skipping");
        }

        handle.advance_state(LifecycleState::Listening);
        info!(
            endpoint = %endpoint.path().display(),
            auth = config.secret.is_some(),
            "broker listening"
        );

        Ok(Self {
            handle,
            endpoint,
            shutdown_tx,
            reason_tx,
            reason_rx,
            tasks,
            child_pid,
        })
    }

    /// The shared state handle.
    #[must_use]
    pub fn handle(&self) -> &SharedBroker {
        &self.handle
    }

    /// The endpoint path clients connect to.
    #[must_use]
    pub fn endpoint_path(&self) -> &std::path::Path {
        self.endpoint.path()
    }

    /// Blocks until a shutdown reason is recorded.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownReason {
        loop {
            if let Some(reason) = *self.reason_rx.borrow() {
                return reason;
            }
            if self.reason_rx.changed().await.is_err() {
                return ShutdownReason::Signal;
            }
        }
    }

    /// Spawns and supervises a child process with the endpoint in its
    /// environment, returning the shutdown reason once the child exits or
    /// a shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns the spawn error when the command cannot be started.
    pub async fn supervise(
        &mut self,
        command: &str,
        args: &[String],
    ) -> std::io::Result<ShutdownReason> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args).env(ENDPOINT_ENV_VAR, self.endpoint.path());
        if let Some(secret) = &self.handle.config().secret {
            cmd.env(SECRET_ENV_VAR, secret);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().map_or(0, |id| id as i32);
        self.child_pid.store(pid, Ordering::SeqCst);
        info!(pid, command, "supervising child process");

        enum Waited {
            ChildExited(std::io::Result<ExitStatus>),
            ShutdownRequested(ShutdownReason),
        }

        let mut reason_rx = self.reason_rx.clone();
        let waited = tokio::select! {
            status = child.wait() => Waited::ChildExited(status),
            reason = wait_for_reason(&mut reason_rx) => Waited::ShutdownRequested(reason),
        };

        let reason = match waited {
            Waited::ChildExited(status) => {
                let code = exit_code_of(status);
                info!(code, "child exited, draining");
                let reason = ShutdownReason::ChildExited(code);
                let _ = self.reason_tx.send(Some(reason));
                reason
            },
            Waited::ShutdownRequested(reason) => {
                // The signal task already forwarded the signal; give the
                // child a moment, then make sure it is gone.
                if tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await.is_err() {
                    warn!("child did not exit in time, killing");
                    let _ = child.kill().await;
                }
                reason
            },
        };
        self.child_pid.store(0, Ordering::SeqCst);
        Ok(reason)
    }

    /// Drains in-flight work: refuses new connections, then polls the
    /// in-flight count until it reaches zero or the timeout elapses.
    ///
    /// Idempotent; the caller proceeds to [`stop`](Self::stop) in either
    /// outcome.
    pub async fn drain(&self, timeout: Duration) -> DrainOutcome {
        self.handle.advance_state(LifecycleState::Draining);
        let deadline = tokio::time::Instant::now() + timeout;

        while self.handle.in_flight() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    in_flight = self.handle.in_flight(),
                    "drain_timeout: proceeding with requests outstanding"
                );
                return DrainOutcome::TimedOut;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!("drain_complete");
        DrainOutcome::Drained
    }

    /// Stops the broker: cancels timers and signal handling, closes the
    /// listener, unlinks the endpoint, and clears both stores.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub async fn stop(&mut self) {
        if self.handle.lifecycle_state() == LifecycleState::Stopped {
            return;
        }
        self.handle.advance_state(LifecycleState::Stopped);

        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.endpoint.unlink();

        let mut stores = self.handle.stores().await;
        stores.values.clear();
        stores.leases.clear();
        drop(stores);

        info!("broker stopped");
    }
}

async fn wait_for_reason(
    rx: &mut watch::Receiver<Option<ShutdownReason>>,
) -> ShutdownReason {
    loop {
        if let Some(reason) = *rx.borrow() {
            return reason;
        }
        if rx.changed().await.is_err() {
            return ShutdownReason::Signal;
        }
    }
}

fn exit_code_of(status: std::io::Result<ExitStatus>) -> i32 {
    match status {
        Ok(status) => status.code().unwrap_or_else(|| {
            // Terminated by signal; mirror the shell convention.
            use std::os::unix::process::ExitStatusExt;
            status.signal().map_or(1, |sig| 128 + sig)
        }),
        Err(_) => 1,
    }
}

/// Signal task: one handler covers both broker drain and child
/// forwarding. Installed once per broker; the guard in `start` prevents
/// stacking.
fn spawn_signal_task(
    reason_tx: watch::Sender<Option<ShutdownReason>>,
    child_pid: Arc<AtomicI32>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            warn!("failed to register SIGTERM handler");
            return;
        };
        let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
            warn!("failed to register SIGINT handler");
            return;
        };

        let forwarded = tokio::select! {
            _ = sigterm.recv() => Signal::SIGTERM,
            _ = sigint.recv() => Signal::SIGINT,
        };
        info!(signal = ?forwarded, "received shutdown signal");

        let pid = child_pid.load(Ordering::SeqCst);
        if pid > 0 {
            debug!(pid, "forwarding signal to child");
            if let Err(e) = kill(Pid::from_raw(pid), forwarded) {
                warn!(pid, error = %e, "failed to forward signal to child");
            }
        }

        let _ = reason_tx.send(Some(ShutdownReason::Signal));
    })
}

/// Idle watchdog: compares wall-clock inactivity against the threshold.
fn spawn_idle_watchdog(
    handle: SharedBroker,
    idle_timeout: Duration,
    reason_tx: watch::Sender<Option<ShutdownReason>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cadence = idle_timeout.min(IDLE_CHECK_INTERVAL);
        let mut ticker = tokio::time::interval(cadence);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let idle_ms = now_ms().saturating_sub(handle.last_activity_ms());
            if idle_ms >= idle_timeout.as_millis() as u64 && handle.in_flight() == 0 {
                info!(idle_ms, "idle timeout reached, shutting down");
                let _ = reason_tx.send(Some(ShutdownReason::Idle));
                return;
            }
        }
    })
}

/// Heartbeat: one info event per interval with uptime, resident memory,
/// and in-flight count.
fn spawn_heartbeat(handle: SharedBroker, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let memory = memory_reading();
            info!(
                uptime_ms = handle.uptime_ms(now_ms()),
                resident_bytes = memory.resident_bytes,
                in_flight = handle.in_flight(),
                "heartbeat"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_pipe_id(pipe_id: &str) -> BrokerConfig {
        BrokerConfig {
            pipe_id: Some(pipe_id.to_string()),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn start_then_stop_cleans_endpoint() {
        let mut broker = Broker::start(config_with_pipe_id("lcstart01"))
            .await
            .unwrap();
        let path = broker.endpoint_path().to_path_buf();
        assert!(path.exists());
        assert_eq!(
            broker.handle().lifecycle_state(),
            LifecycleState::Listening
        );

        broker.stop().await;
        assert!(!path.exists());
        assert_eq!(broker.handle().lifecycle_state(), LifecycleState::Stopped);

        // Second stop is a no-op.
        broker.stop().await;
    }

    #[tokio::test]
    async fn start_exports_endpoint_env() {
        let mut broker = Broker::start(config_with_pipe_id("lcenv01")).await.unwrap();
        // Parallel tests each export their own path; assert the variable
        // holds a broker socket rather than this exact one.
        let exported = std::env::var(ENDPOINT_ENV_VAR).unwrap();
        assert!(exported.contains("broker-"));
        assert!(exported.ends_with(".sock"));
        broker.stop().await;
    }

    #[tokio::test]
    async fn drain_with_no_work_completes_immediately() {
        let mut broker = Broker::start(config_with_pipe_id("lcdrain01")).await.unwrap();
        let outcome = broker.drain(Duration::from_millis(500)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
        assert!(broker.handle().is_draining());
        broker.stop().await;
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_work() {
        let mut broker = Broker::start(config_with_pipe_id("lcdrain02")).await.unwrap();
        broker.handle().begin_request(now_ms());

        let outcome = broker.drain(Duration::from_millis(100)).await;
        assert_eq!(outcome, DrainOutcome::TimedOut);

        broker.handle().end_request();
        broker.stop().await;
    }

    #[tokio::test]
    async fn stop_clears_stores() {
        let mut broker = Broker::start(config_with_pipe_id("lcclear01")).await.unwrap();
        {
            let mut stores = broker.handle().stores().await;
            stores
                .values
                .set("k", serde_json::json!(1), Some(60_000), false, now_ms())
                .unwrap();
            stores.leases.lease("p", "w", Some(60_000), now_ms()).unwrap();
        }

        broker.stop().await;

        let mut stores = broker.handle().stores().await;
        assert_eq!(stores.values.live_count(now_ms()), 0);
        assert_eq!(stores.leases.live_count(now_ms()), 0);
        assert!(!stores.values.del("k"));
    }

    #[tokio::test]
    async fn supervised_child_exit_code_propagates() {
        let mut broker = Broker::start(config_with_pipe_id("lcchild01")).await.unwrap();
        let reason = broker
            .supervise("sh", &["-c".to_string(), "exit 7".to_string()])
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::ChildExited(7));
        assert_eq!(reason.exit_code(), 7);
        broker.stop().await;
    }

    #[tokio::test]
    async fn supervised_child_sees_endpoint_env() {
        let mut broker = Broker::start(config_with_pipe_id("lcchild02")).await.unwrap();
        let reason = broker
            .supervise(
                "sh",
                &[
                    "-c".to_string(),
                    format!("test -S \"${ENDPOINT_ENV_VAR}\""),
                ],
            )
            .await
            .unwrap();
        assert_eq!(reason, ShutdownReason::ChildExited(0));
        broker.stop().await;
    }

    #[tokio::test]
    async fn idle_watchdog_requests_shutdown() {
        let config = BrokerConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..config_with_pipe_id("lcidle01")
        };
        let mut broker = Broker::start(config).await.unwrap();
        let reason = tokio::time::timeout(
            Duration::from_secs(5),
            broker.wait_for_shutdown(),
        )
        .await
        .expect("idle shutdown should fire");
        assert_eq!(reason, ShutdownReason::Idle);
        broker.stop().await;
    }

    #[tokio::test]
    async fn shutdown_reason_exit_codes() {
        assert_eq!(ShutdownReason::Signal.exit_code(), 0);
        assert_eq!(ShutdownReason::Idle.exit_code(), 0);
        assert_eq!(ShutdownReason::ChildExited(3).exit_code(), 3);
    }
}
