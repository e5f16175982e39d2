//! Stream (TCP) client registry.
//!
//! Accepts connections on one bound listener, tracks each client under a
//! monotonic id, runs one inbound-forwarding task per client, and fans
//! upstream messages out to every registered client. Any I/O failure on a
//! client - read, end-of-stream, upstream forward, or broadcast write -
//! deregisters and closes that client without touching the others.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::event::{EventSender, RelayEvent};
use crate::upstream::{Broadcast, UpstreamLink};

/// Size of each client read; one read becomes one upstream binary message.
pub const CLIENT_READ_BUFFER: usize = 4096;

/// A bidirectional byte stream usable as a client connection.
pub trait StreamConn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamConn for T {}

/// Accepts stream client connections. One production implementation
/// ([`TcpStreamListener`]); tests drive the registry with in-memory pipes.
#[async_trait]
pub trait StreamListener: Send + Sync {
    /// Wait for the next client connection.
    async fn accept(&self) -> io::Result<(Box<dyn StreamConn>, SocketAddr)>;

    /// The bound local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// TCP listener for ground-control stream clients.
pub struct TcpStreamListener {
    listener: TcpListener,
}

impl TcpStreamListener {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns the bind failure; the relay treats it as fatal at startup.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl StreamListener for TcpStreamListener {
    async fn accept(&self) -> io::Result<(Box<dyn StreamConn>, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

struct StreamClient {
    peer: SocketAddr,
    writer: Mutex<WriteHalf<Box<dyn StreamConn>>>,
    // Wakes the forwarder out of its blocking read on deregistration, so a
    // removed client's task never outlives its registry entry.
    stop: watch::Sender<bool>,
}

/// Registry of connected stream clients.
pub struct StreamRegistry {
    clients: DashMap<u64, Arc<StreamClient>>,
    // Monotonic ids: remote addresses can collide across reconnecting
    // clients, ids cannot.
    next_id: AtomicU64,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    events: EventSender,
}

impl StreamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(events: EventSender) -> Self {
        Self {
            clients: DashMap::new(),
            next_id: AtomicU64::new(1),
            forwarders: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Number of currently registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Run the accept loop until shutdown. Each accepted connection gets a
    /// registry entry and a dedicated inbound-forwarding task.
    pub async fn run_accept_loop(
        self: Arc<Self>,
        listener: Box<dyn StreamListener>,
        upstream: Arc<UpstreamLink>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((conn, peer)) => {
                    self.register(conn, peer, Arc::clone(&upstream), shutdown.clone())
                        .await;
                }
                Err(e) => {
                    if *shutdown.borrow() {
                        return;
                    }
                    tracing::warn!(error = %e, "stream accept failed");
                }
            }
        }
    }

    /// Register a connection and spawn its forwarding task.
    pub async fn register(
        self: &Arc<Self>,
        conn: Box<dyn StreamConn>,
        peer: SocketAddr,
        upstream: Arc<UpstreamLink>,
        shutdown: watch::Receiver<bool>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = tokio::io::split(conn);
        let (stop_tx, stop_rx) = watch::channel(false);
        self.clients.insert(
            id,
            Arc::new(StreamClient {
                peer,
                writer: Mutex::new(writer),
                stop: stop_tx,
            }),
        );
        tracing::info!(id, %peer, "stream client connected");
        self.events.emit(RelayEvent::StreamClientConnected { id, peer });

        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            registry
                .forward_client(id, reader, upstream, shutdown, stop_rx)
                .await;
        });
        self.forwarders.lock().await.push(handle);
        id
    }

    /// Read from one client and forward each read verbatim upstream.
    async fn forward_client(
        &self,
        id: u64,
        mut reader: ReadHalf<Box<dyn StreamConn>>,
        upstream: Arc<UpstreamLink>,
        mut shutdown: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; CLIENT_READ_BUFFER];
        loop {
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                _ = stop.changed() => break,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    tracing::debug!(id, "stream client closed connection");
                    break;
                }
                Ok(n) => {
                    if let Err(e) = upstream.send_frame(&buf[..n]).await {
                        tracing::warn!(id, error = %e, "failed to forward client bytes upstream");
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(id, error = %e, "stream client read failed");
                    break;
                }
            }
        }
        self.deregister(id).await;
    }

    /// Remove a client and close its connection. Safe to call twice; the
    /// second call finds nothing.
    pub async fn deregister(&self, id: u64) {
        if let Some((_, client)) = self.clients.remove(&id) {
            let _ = client.stop.send(true);
            let mut writer = client.writer.lock().await;
            let _ = writer.shutdown().await;
            tracing::info!(id, peer = %client.peer, "stream client deregistered");
            self.events.emit(RelayEvent::StreamClientDisconnected { id });
        }
    }

    /// Deregister every client and wait for all forwarding tasks to exit.
    pub async fn shutdown_all(&self) {
        let ids: Vec<u64> = self.clients.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.deregister(id).await;
        }
        let handles = std::mem::take(&mut *self.forwarders.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl Broadcast for StreamRegistry {
    async fn broadcast(&self, payload: &[u8]) {
        // Snapshot the membership first: map guards must not be held across
        // the writes, and a client registered mid-broadcast waits for the
        // next message.
        let clients: Vec<(u64, Arc<StreamClient>)> = self
            .clients
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut failed = Vec::new();
        for (id, client) in clients {
            let mut writer = client.writer.lock().await;
            if let Err(e) = writer.write_all(payload).await {
                tracing::warn!(id, error = %e, "failed to write to stream client");
                failed.push(id);
            }
        }

        // A failed write evicts the client, same as a failed read.
        for id in failed {
            self.deregister(id).await;
        }
    }
}
