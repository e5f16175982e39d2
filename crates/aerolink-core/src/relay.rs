//! Relay orchestration.
//!
//! A [`Relay`] ties the pieces together: it dials the upstream link, binds the
//! configured local listeners, spawns the accept/receive/read loops, and tears
//! everything down on [`Relay::stop`]. It moves through a strict lifecycle -
//! created, started, stopped - and never goes backwards.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::datagram_clients::DatagramRegistry;
use crate::error::RelayError;
use crate::event::{EventSender, RelayEvent};
use crate::gate::{FailureGate, GateState};
use crate::stream_clients::{StreamListener, StreamRegistry, TcpStreamListener};
use crate::upstream::{Broadcast, UpstreamConnector, UpstreamLink, WsConnector};

const CREATED: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// The relay bridge: one upstream WebSocket session fanned out to local
/// stream and datagram clients, and back.
pub struct Relay {
    config: RelayConfig,
    connector: Arc<dyn UpstreamConnector>,
    state: AtomicU8,
    events: EventSender,
    shutdown_tx: watch::Sender<bool>,
    upstream: Mutex<Option<Arc<UpstreamLink>>>,
    streams: Mutex<Option<Arc<StreamRegistry>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stream_addr: Mutex<Option<SocketAddr>>,
    datagram_addr: Mutex<Option<SocketAddr>>,
}

impl Relay {
    /// Create a relay speaking WebSocket upstream.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector))
    }

    /// Create a relay with a custom upstream connector. This is the seam the
    /// tests use to run the full relay without a network.
    #[must_use]
    pub fn with_connector(config: RelayConfig, connector: Arc<dyn UpstreamConnector>) -> Self {
        let events = EventSender::new(config.event_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            connector,
            state: AtomicU8::new(CREATED),
            events,
            shutdown_tx,
            upstream: Mutex::new(None),
            streams: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            stream_addr: Mutex::new(None),
            datagram_addr: Mutex::new(None),
        }
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    /// Actual stream listen address once started. Useful when the configured
    /// address carried port zero.
    pub async fn stream_local_addr(&self) -> Option<SocketAddr> {
        *self.stream_addr.lock().await
    }

    /// Actual datagram listen address once started.
    pub async fn datagram_local_addr(&self) -> Option<SocketAddr> {
        *self.datagram_addr.lock().await
    }

    /// Gate state and consecutive failure count, `None` before start.
    pub async fn gate_snapshot(&self) -> Option<(GateState, u32)> {
        match self.upstream.lock().await.as_ref() {
            Some(upstream) => Some(upstream.gate_snapshot().await),
            None => None,
        }
    }

    /// Connect upstream, bind the configured listeners, and spawn the relay
    /// loops. Runs once per relay.
    ///
    /// # Errors
    ///
    /// `RelayError::InvalidState` if the relay already started or stopped. A
    /// failed upstream handshake or listener bind is fatal and returns the
    /// relay to its created state, so a caller may retry.
    pub async fn start(&self) -> Result<(), RelayError> {
        self.state
            .compare_exchange(CREATED, STARTED, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| RelayError::InvalidState)?;

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state.store(CREATED, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), RelayError> {
        let gate = FailureGate::new(
            self.config.failure_threshold,
            self.config.gate_cooldown,
            self.config.base_retry_delay,
        );
        let upstream = Arc::new(UpstreamLink::new(
            Arc::clone(&self.connector),
            self.config.upstream_url.clone(),
            self.config.bearer_token.clone(),
            self.config.connect_timeout,
            gate,
            self.events.clone(),
        ));

        // All fallible startup work happens before anything is spawned, so a
        // failed start leaves no task behind.
        let reader = upstream.connect().await?;

        let stream_listener = match self.config.stream_listen {
            Some(addr) => {
                let listener = TcpStreamListener::bind(addr)
                    .await
                    .map_err(|source| RelayError::Bind { addr, source })?;
                let local = listener
                    .local_addr()
                    .map_err(|source| RelayError::Bind { addr, source })?;
                tracing::info!(%local, "stream listener bound");
                Some((listener, local))
            }
            None => None,
        };

        let datagram_socket = match self.config.datagram_listen {
            Some(addr) => {
                let socket = UdpSocket::bind(addr)
                    .await
                    .map_err(|source| RelayError::Bind { addr, source })?;
                let local = socket
                    .local_addr()
                    .map_err(|source| RelayError::Bind { addr, source })?;
                tracing::info!(%local, "datagram socket bound");
                Some((socket, local))
            }
            None => None,
        };

        let shutdown_rx = self.shutdown_tx.subscribe();
        let mut targets: Vec<Arc<dyn Broadcast>> = Vec::new();
        let mut tasks = Vec::new();

        if let Some((listener, local)) = stream_listener {
            *self.stream_addr.lock().await = Some(local);
            let registry = Arc::new(StreamRegistry::new(self.events.clone()));
            targets.push(Arc::clone(&registry) as Arc<dyn Broadcast>);
            *self.streams.lock().await = Some(Arc::clone(&registry));

            let accept_upstream = Arc::clone(&upstream);
            let accept_shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .run_accept_loop(Box::new(listener), accept_upstream, accept_shutdown)
                    .await;
            }));
        }

        if let Some((socket, local)) = datagram_socket {
            *self.datagram_addr.lock().await = Some(local);
            let registry = Arc::new(DatagramRegistry::new(
                Arc::new(socket),
                self.events.clone(),
            ));
            targets.push(Arc::clone(&registry) as Arc<dyn Broadcast>);

            let recv_upstream = Arc::clone(&upstream);
            let recv_shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                registry.run_receive_loop(recv_upstream, recv_shutdown).await;
            }));
        }

        let read_upstream = Arc::clone(&upstream);
        tasks.push(tokio::spawn(async move {
            read_upstream.read_loop(reader, targets, shutdown_rx).await;
        }));

        *self.upstream.lock().await = Some(upstream);
        *self.tasks.lock().await = tasks;
        tracing::info!("relay started");
        Ok(())
    }

    /// Stop the relay: signal every loop, close the upstream session, and
    /// disconnect all clients. Calling stop more than once is a no-op.
    pub async fn stop(&self) {
        let previous = self.state.swap(STOPPED, Ordering::SeqCst);
        if previous != STARTED {
            return;
        }

        tracing::info!("relay stopping");
        let _ = self.shutdown_tx.send(true);

        if let Some(streams) = self.streams.lock().await.take() {
            streams.shutdown_all().await;
        }
        if let Some(upstream) = self.upstream.lock().await.take() {
            upstream.shutdown().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("relay stopped");
    }
}
