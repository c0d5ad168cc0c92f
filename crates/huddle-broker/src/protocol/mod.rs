//! Wire protocol: framing, authentication, and dispatch.
//!
//! The protocol stack is organized in layers:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              Handlers                   │  store / lease / observability
//! ├─────────────────────────────────────────┤
//! │              Dispatch                   │  action string → handler
//! ├─────────────────────────────────────────┤
//! │           Authentication                │  optional HMAC-SHA256
//! ├─────────────────────────────────────────┤
//! │               Framing                   │  newline-delimited JSON
//! ├─────────────────────────────────────────┤
//! │            UDS transport                │  Unix socket
//! └─────────────────────────────────────────┘
//! ```
//!
//! Each frame is one JSON object terminated by `\n`; the response to a
//! request is the next line written on the same connection. The decoder
//! enforces the per-connection byte cap before scanning for a newline so an
//! oversized frame is rejected without unbounded buffering.

pub mod auth;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod wire;

pub use auth::Authenticator;
pub use codec::LineCodec;
pub use error::{ErrorToken, ProtocolError};
pub use wire::Request;
