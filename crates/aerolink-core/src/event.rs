//! Lifecycle observability events.
//!
//! The core emits an event at every lifecycle transition (upstream
//! connected/disconnected, gate open/close, client churn) so an external
//! observer - the CLI, a test - can follow along without the core knowing who
//! is listening. Delivery is best-effort over a broadcast channel; a slow or
//! absent subscriber never blocks the relay.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;

/// A lifecycle transition observed by the relay core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// An upstream session was established (initial connect or reconnect).
    UpstreamConnected,

    /// The upstream session failed; the reconnect procedure is about to run.
    UpstreamDisconnected,

    /// A reconnect attempt is starting.
    Reconnecting {
        /// 1-based attempt number within this outage.
        attempt: u32,
    },

    /// The failure gate opened; no reconnect until the cooldown expires.
    GateOpened {
        /// How long the gate stays open.
        cooldown: Duration,
    },

    /// Data flowed again after an outage; the gate is closed.
    GateClosed,

    /// A stream client connected and was registered.
    StreamClientConnected {
        /// Registry key of the client.
        id: u64,
        /// Remote endpoint of the client.
        peer: SocketAddr,
    },

    /// A stream client was deregistered and its connection closed.
    StreamClientDisconnected {
        /// Registry key of the client.
        id: u64,
    },

    /// A datagram arrived from a previously unseen endpoint.
    DatagramEndpointSeen {
        /// The newly registered endpoint.
        peer: SocketAddr,
    },
}

/// Cloneable emitter half of the event channel.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventSender {
    /// Create an emitter with room for `capacity` undelivered events per
    /// subscriber. Laggy subscribers lose old events, never relay progress.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Emit an event. A send error only means nobody is subscribed.
    pub fn emit(&self, event: RelayEvent) {
        tracing::debug!(?event, "relay event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}
