//! Error types for the relay engine.
//!
//! Startup failures (`RelayError`) surface to the caller and abort the whole
//! process; steady-state upstream failures (`UpstreamError`) are contained by
//! the read loop and drive the failure gate instead of propagating.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Fatal relay errors - these abort startup.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Initial upstream connect failed. There is no retry at startup; the
    /// reconnect machinery only runs during steady-state operation.
    #[error("upstream connect failed: {0}")]
    Connect(#[from] UpstreamError),

    /// A local listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The listen address that was requested.
        addr: SocketAddr,
        /// The underlying bind failure.
        #[source]
        source: io::Error,
    },

    /// `start()` was called on a relay that is not in the created state.
    #[error("relay already started or stopped")]
    InvalidState,
}

/// Upstream session errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The connect handshake did not complete within the configured timeout.
    #[error("upstream connect timed out")]
    Timeout,

    /// The handshake was rejected (bad URL, authorization failure,
    /// unreachable host).
    #[error("upstream handshake failed: {0}")]
    Handshake(String),

    /// A write was attempted with no active session.
    #[error("upstream not connected")]
    NotConnected,

    /// Transport-level failure on an established session.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The remote closed the session.
    #[error("upstream connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UpstreamError::NotConnected;
        assert_eq!(err.to_string(), "upstream not connected");

        let err = RelayError::Bind {
            addr: "127.0.0.1:14550".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("127.0.0.1:14550"));
    }

    #[test]
    fn test_connect_error_wraps_upstream() {
        let err = RelayError::from(UpstreamError::Timeout);
        assert!(matches!(err, RelayError::Connect(UpstreamError::Timeout)));
    }
}
