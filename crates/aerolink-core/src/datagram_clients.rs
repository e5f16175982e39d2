//! Datagram (UDP) client registry.
//!
//! One bound socket shared by all clients. Endpoints are registered the first
//! time a datagram arrives from them and stay registered until shutdown;
//! there is no liveness probing or expiry (the first-seen timestamp is kept
//! so an eviction pass can be added without a data-model change).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::event::{EventSender, RelayEvent};
use crate::upstream::{Broadcast, UpstreamLink};

/// Receive buffer size; covers the largest possible UDP payload.
pub const DATAGRAM_BUFFER: usize = 65_536;

/// A bound datagram socket. One production implementation (tokio's
/// [`UdpSocket`]); tests drive the registry with channel-backed fakes.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Receive one datagram into `buf`.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to `addr`.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// The bound local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Registry of datagram endpoints sharing one socket.
pub struct DatagramRegistry {
    socket: Arc<dyn DatagramSocket>,
    endpoints: DashMap<SocketAddr, Instant>,
    events: EventSender,
}

impl DatagramRegistry {
    /// Create a registry over an already-bound socket.
    #[must_use]
    pub fn new(socket: Arc<dyn DatagramSocket>, events: EventSender) -> Self {
        Self {
            socket,
            endpoints: DashMap::new(),
            events,
        }
    }

    /// Number of distinct endpoints seen so far.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Run the receive loop until shutdown. Each datagram registers its
    /// source endpoint on first sight and is forwarded verbatim upstream.
    pub async fn run_receive_loop(
        &self,
        upstream: Arc<UpstreamLink>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; DATAGRAM_BUFFER];
        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => return,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((n, peer)) => {
                    if let Entry::Vacant(slot) = self.endpoints.entry(peer) {
                        slot.insert(Instant::now());
                        tracing::info!(%peer, "datagram endpoint registered");
                        self.events.emit(RelayEvent::DatagramEndpointSeen { peer });
                    }

                    if let Err(e) = upstream.send_frame(&buf[..n]).await {
                        tracing::warn!(%peer, error = %e, "failed to forward datagram upstream");
                    }
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        return;
                    }
                    tracing::warn!(error = %e, "datagram receive failed");
                }
            }
        }
    }
}

#[async_trait]
impl Broadcast for DatagramRegistry {
    async fn broadcast(&self, payload: &[u8]) {
        let peers: Vec<SocketAddr> = self.endpoints.iter().map(|entry| *entry.key()).collect();
        for peer in peers {
            // One failed destination never aborts delivery to the rest.
            if let Err(e) = self.socket.send_to(payload, peer).await {
                tracing::warn!(%peer, error = %e, "failed to send datagram to endpoint");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UpstreamError;
    use crate::gate::FailureGate;
    use crate::upstream::{FrameSink, FrameStream, Inbound, UpstreamConnector};
    use std::time::Duration;
    use tokio::sync::{Mutex, mpsc};

    /// Channel-backed datagram socket: the test injects inbound datagrams and
    /// observes outbound sends. Sends to `fail_addr` error.
    struct FakeSocket {
        inbound: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
        outbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
        local: SocketAddr,
        fail_addr: Option<SocketAddr>,
    }

    #[async_trait]
    impl DatagramSocket for FakeSocket {
        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some((data, peer)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), peer))
                }
                None => std::future::pending().await,
            }
        }

        async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            if self.fail_addr == Some(addr) {
                return Err(io::Error::from(io::ErrorKind::HostUnreachable));
            }
            self.outbound
                .send((buf.to_vec(), addr))
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(buf.len())
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(self.local)
        }
    }

    struct CaptureSink {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl FrameSink for CaptureSink {
        async fn send_binary(&mut self, payload: &[u8]) -> Result<(), UpstreamError> {
            self.tx
                .send(payload.to_vec())
                .map_err(|_| UpstreamError::Closed)
        }

        async fn close(&mut self) {}
    }

    struct IdleStream;

    #[async_trait]
    impl FrameStream for IdleStream {
        async fn recv(&mut self) -> Result<Inbound, UpstreamError> {
            std::future::pending().await
        }
    }

    struct CaptureConnector {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl UpstreamConnector for CaptureConnector {
        async fn connect(
            &self,
            _url: &str,
            _token: &str,
            _timeout: Duration,
        ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), UpstreamError> {
            Ok((
                Box::new(CaptureSink {
                    tx: self.tx.clone(),
                }),
                Box::new(IdleStream),
            ))
        }
    }

    struct Fixture {
        registry: Arc<DatagramRegistry>,
        inject: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
        sent: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
        frames: mpsc::UnboundedReceiver<Vec<u8>>,
        shutdown_tx: watch::Sender<bool>,
    }

    async fn fixture() -> Fixture {
        fixture_with(None).await
    }

    async fn fixture_with(fail_addr: Option<SocketAddr>) -> Fixture {
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, sent) = mpsc::unbounded_channel();
        let socket = Arc::new(FakeSocket {
            inbound: Mutex::new(inbound),
            outbound,
            local: SocketAddr::from(([127, 0, 0, 1], 14550)),
            fail_addr,
        });

        let (frame_tx, frames) = mpsc::unbounded_channel();
        let upstream = Arc::new(UpstreamLink::new(
            Arc::new(CaptureConnector { tx: frame_tx }),
            "ws://upstream/ws",
            "token",
            Duration::from_secs(1),
            FailureGate::default(),
            EventSender::new(16),
        ));
        upstream.connect().await.unwrap();

        let registry = Arc::new(DatagramRegistry::new(socket, EventSender::new(16)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_registry = Arc::clone(&registry);
        tokio::spawn(async move {
            loop_registry.run_receive_loop(upstream, shutdown_rx).await;
        });

        Fixture {
            registry,
            inject,
            sent,
            frames,
            shutdown_tx,
        }
    }

    fn endpoint(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_datagram_forwarded_upstream_and_endpoint_registered() {
        let mut fx = fixture().await;

        fx.inject.send((b"X".to_vec(), endpoint(6000))).unwrap();

        assert_eq!(fx.frames.recv().await.unwrap(), b"X");
        assert_eq!(fx.registry.endpoint_count(), 1);
        let _ = fx.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_endpoint_registered_once() {
        let mut fx = fixture().await;

        fx.inject.send((b"one".to_vec(), endpoint(6001))).unwrap();
        fx.inject.send((b"two".to_vec(), endpoint(6001))).unwrap();

        assert_eq!(fx.frames.recv().await.unwrap(), b"one");
        assert_eq!(fx.frames.recv().await.unwrap(), b"two");
        assert_eq!(fx.registry.endpoint_count(), 1);
        let _ = fx.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_broadcast_sends_to_every_known_endpoint() {
        let mut fx = fixture().await;

        fx.inject.send((b"a".to_vec(), endpoint(6002))).unwrap();
        fx.inject.send((b"b".to_vec(), endpoint(6003))).unwrap();
        fx.frames.recv().await.unwrap();
        fx.frames.recv().await.unwrap();

        fx.registry.broadcast(b"Y").await;

        let mut destinations = vec![
            fx.sent.recv().await.unwrap(),
            fx.sent.recv().await.unwrap(),
        ];
        destinations.sort_by_key(|(_, addr)| addr.port());
        assert_eq!(destinations[0], (b"Y".to_vec(), endpoint(6002)));
        assert_eq!(destinations[1], (b"Y".to_vec(), endpoint(6003)));
        let _ = fx.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_broadcast_failure_skips_only_failed_endpoint() {
        let mut fx = fixture_with(Some(endpoint(6004))).await;

        fx.inject.send((b"a".to_vec(), endpoint(6004))).unwrap();
        fx.inject.send((b"b".to_vec(), endpoint(6005))).unwrap();
        fx.frames.recv().await.unwrap();
        fx.frames.recv().await.unwrap();

        fx.registry.broadcast(b"Y").await;

        // The unreachable endpoint is skipped; delivery to the rest proceeds.
        assert_eq!(fx.sent.recv().await.unwrap(), (b"Y".to_vec(), endpoint(6005)));
        assert_eq!(fx.registry.endpoint_count(), 2);
        let _ = fx.shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_endpoints_is_a_no_op() {
        let fx = fixture().await;
        fx.registry.broadcast(b"Y").await;
        assert_eq!(fx.registry.endpoint_count(), 0);
        let _ = fx.shutdown_tx.send(true);
    }
}
