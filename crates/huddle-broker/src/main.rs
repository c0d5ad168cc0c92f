//! huddle-broker binary.
//!
//! Starts the broker, optionally supervises a child command (typically the
//! test runner whose workers will connect), and exits when the child
//! exits, a signal arrives, or the idle watchdog fires. The endpoint path
//! is exported as `BROKER_ENDPOINT` so descendants can find the socket.
//!
//! Configuration comes from `BROKER_*` environment variables; the flags
//! below override individual options for operator convenience.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use huddle_broker::{Broker, BrokerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Ephemeral key/value and lease broker for parallel workers.
#[derive(Parser, Debug)]
#[command(name = "huddle-broker")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log events rather than human lines
    #[arg(long)]
    structured_logging: bool,

    /// Shut down after this many milliseconds of inactivity
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Emit a heartbeat event every this many milliseconds
    #[arg(long)]
    heartbeat_interval: Option<u64>,

    /// Override the random endpoint path suffix
    #[arg(long)]
    pipe_id: Option<String>,

    /// Command (with arguments) to run under supervision
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn apply_overrides(config: &mut BrokerConfig, args: &Args) {
    if let Some(level) = &args.log_level {
        config.log_level.clone_from(level);
    }
    if args.structured_logging {
        config.structured_logging = true;
    }
    if let Some(ms) = args.idle_timeout {
        config.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms));
    }
    if let Some(ms) = args.heartbeat_interval {
        config.heartbeat_interval = (ms > 0).then(|| Duration::from_millis(ms));
    }
    if let Some(pipe_id) = &args.pipe_id {
        config.pipe_id = Some(pipe_id.clone());
    }
}

fn init_tracing(config: &BrokerConfig) {
    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.structured_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = BrokerConfig::from_env();
    apply_overrides(&mut config, &args);
    init_tracing(&config);

    let drain_timeout = config.drain_timeout();
    let mut broker = Broker::start(config)
        .await
        .context("failed to start broker")?;

    let reason = if args.command.is_empty() {
        broker.wait_for_shutdown().await
    } else {
        let (command, rest) = args
            .command
            .split_first()
            .expect("command checked non-empty");
        broker
            .supervise(command, rest)
            .await
            .with_context(|| format!("failed to spawn {command}"))?
    };

    broker.drain(drain_timeout).await;
    broker.stop().await;

    let code = reason.exit_code();
    info!(?reason, code, "exiting");
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
