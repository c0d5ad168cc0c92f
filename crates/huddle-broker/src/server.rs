//! Connection server: accept loop and per-connection frame handling.
//!
//! Each connection gets its own task owning a [`Framed`] line transport.
//! Frames are processed strictly in order: the server writes one response
//! line per request before decoding the next frame, which gives a single
//! client its request/response ordering for free.
//!
//! A connection accepted while the broker is draining receives one
//! `{"ok":false,"error":"draining"}` line and is closed; frames already in
//! flight on older connections run to completion.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, warn};

use crate::protocol::dispatch::Pipeline;
use crate::protocol::error::{ErrorToken, ProtocolError};
use crate::protocol::wire::{error_response, to_frame};
use crate::protocol::LineCodec;
use crate::state::SharedBroker;

/// Spawns the accept loop. It exits when `shutdown` observes `true`; the
/// listener (and with it the accept queue) is dropped on exit.
pub fn spawn(
    broker: SharedBroker,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let pipeline = Pipeline::new(broker.clone());
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let broker = broker.clone();
                            let pipeline = pipeline.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                handle_connection(broker, pipeline, stream, shutdown).await;
                            });
                        },
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        },
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("accept loop shutting down");
                        break;
                    }
                },
            }
        }
    })
}

/// Handles one client connection to completion.
async fn handle_connection(
    broker: SharedBroker,
    pipeline: Pipeline,
    stream: UnixStream,
    _shutdown: watch::Receiver<bool>,
) {
    let codec = LineCodec::new(broker.config().max_request_size);
    let mut framed = Framed::new(stream, codec);

    if broker.is_draining() {
        debug!("refusing connection while draining");
        let line = to_frame(&error_response(ErrorToken::Draining));
        let _ = framed.send(Bytes::from(line)).await;
        return;
    }

    while let Some(frame) = framed.next().await {
        match frame {
            Ok(raw) => {
                let response = pipeline.process(&raw).await;
                if let Err(e) = framed.send(Bytes::from(response)).await {
                    // The client may have gone away mid-request; the
                    // handler already completed, only the write is lost.
                    debug!(error = %e, "failed to write response");
                    break;
                }
            },
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                warn!(size, max, "request buffer exceeded cap, closing connection");
                let line = to_frame(&error_response(ErrorToken::TooLarge));
                let _ = framed.send(Bytes::from(line)).await;
                break;
            },
            Err(ProtocolError::Io(e)) => {
                debug!(error = %e, "connection read error");
                break;
            },
        }
    }
}
