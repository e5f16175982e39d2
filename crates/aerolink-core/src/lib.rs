//! # AeroLink Core
//!
//! Relay engine bridging one upstream telemetry WebSocket to many local
//! ground-control clients.
//!
//! This crate provides:
//! - The upstream link: a single authenticated WebSocket session with
//!   gate-governed reconnection
//! - The failure gate: a circuit-breaker state machine deciding when
//!   reconnects may run
//! - Stream (TCP) and datagram (UDP) client registries with bidirectional
//!   fan-out
//! - A lifecycle event channel for observers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Cloud relay (WSS)                          │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ one session, bearer-token auth
//! ┌───────────────────────────────┴─────────────────────────────────┐
//! │                      UpstreamLink + FailureGate                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │              StreamRegistry          DatagramRegistry            │
//! │              (TCP clients)           (UDP endpoints)             │
//! └──────┬──────────────┬──────────────────────┬────────────────────┘
//!        │              │                      │
//!     GCS #1         GCS #2                 GCS #3
//! ```
//!
//! Payloads cross the bridge verbatim in both directions: one client read
//! becomes one upstream binary message, one upstream binary message is
//! written whole to every registered client.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod datagram_clients;
pub mod error;
pub mod event;
pub mod gate;
pub mod relay;
pub mod stream_clients;
pub mod upstream;

pub use config::{RelayConfig, relay_url};
pub use datagram_clients::{DatagramRegistry, DatagramSocket};
pub use error::{RelayError, UpstreamError};
pub use event::{EventSender, RelayEvent};
pub use gate::{FailureGate, GateState, Retry};
pub use relay::Relay;
pub use stream_clients::{StreamConn, StreamListener, StreamRegistry, TcpStreamListener};
pub use upstream::{
    Broadcast, FrameSink, FrameStream, Inbound, UpstreamConnector, UpstreamLink, WsConnector,
};
