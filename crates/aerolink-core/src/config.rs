//! Relay configuration.

use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

use crate::gate::{DEFAULT_BASE_RETRY_DELAY, DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD};

/// Timeout for the upstream connect handshake. Deliberately shorter than the
/// gate cooldown so a hung handshake never eats into the open window.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-subscriber capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Immutable relay configuration.
///
/// The core consumes only a bearer token, an upstream URL, and zero or more
/// local listen addresses; everything else here is tuning with sensible
/// defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream WebSocket URL (`ws://` or `wss://`).
    pub upstream_url: String,
    /// Bearer token attached to the upstream handshake.
    pub bearer_token: String,
    /// TCP listen address for stream clients, if any.
    pub stream_listen: Option<SocketAddr>,
    /// UDP listen address for datagram clients, if any.
    pub datagram_listen: Option<SocketAddr>,
    /// Upstream connect handshake timeout.
    pub connect_timeout: Duration,
    /// Consecutive failures before the gate opens.
    pub failure_threshold: u32,
    /// How long the gate stays open.
    pub gate_cooldown: Duration,
    /// Base delay between sub-threshold reconnect attempts.
    pub base_retry_delay: Duration,
    /// Event channel capacity per subscriber.
    pub event_capacity: usize,
}

impl RelayConfig {
    /// Configuration with default tuning and no listeners.
    #[must_use]
    pub fn new(upstream_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            upstream_url: upstream_url.into(),
            bearer_token: bearer_token.into(),
            stream_listen: None,
            datagram_listen: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            gate_cooldown: DEFAULT_COOLDOWN,
            base_retry_delay: DEFAULT_BASE_RETRY_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Derive the upstream relay URL for a device from the API base URL.
///
/// `http(s)` maps to `ws(s)`; the device's relay channel lives at a fixed
/// path under the API root.
///
/// # Errors
///
/// Returns an error if the base URL does not parse.
pub fn relay_url(api_base: &str, device_id: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(api_base)?;

    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        // Infallible: http(s) and ws(s) are both "special" schemes.
        let _ = url.set_scheme(scheme);
    }

    let base_path = url.path().trim_end_matches('/').to_owned();
    url.set_path(&format!("{base_path}/v1/mavlink/web/{device_id}/ws"));
    Ok(url.to_string())
}
