//! Upstream WebSocket link.
//!
//! Owns the single active upstream session: connect and reconnect, serialized
//! outbound writes, and the inbound read loop. Read failures feed the
//! [`FailureGate`]; reconnection waits on whatever the gate dictates.
//!
//! A session is a pair of boxed halves behind the [`UpstreamConnector`] seam:
//! the write half ([`FrameSink`]) lives in a mutex slot shared with every
//! client forwarder, the read half ([`FrameStream`]) is owned exclusively by
//! the read loop. One lock covers "read current session" and "swap session",
//! so no writer ever observes a half-closed handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::UpstreamError;
use crate::event::{EventSender, RelayEvent};
use crate::gate::{FailureGate, GateState, Retry};

/// One item received from the upstream session.
#[derive(Debug)]
pub enum Inbound {
    /// A binary message - the only kind the relay forwards.
    Binary(Vec<u8>),
    /// Text or control traffic; discarded without forwarding.
    Other,
}

/// Write half of an upstream session.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one payload as exactly one binary message. The relay never splits
    /// or coalesces payloads.
    async fn send_binary(&mut self, payload: &[u8]) -> Result<(), UpstreamError>;

    /// Close the session. Best-effort; errors here are not actionable.
    async fn close(&mut self);
}

/// Read half of an upstream session.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next message. An error means the session is dead.
    async fn recv(&mut self) -> Result<Inbound, UpstreamError>;
}

/// Dials upstream sessions. One production implementation ([`WsConnector`])
/// and channel-backed fakes in the tests.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Open a session with the bearer token attached to the handshake,
    /// bounded by `timeout`.
    async fn connect(
        &self,
        url: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), UpstreamError>;
}

/// Fan-out target for upstream binary messages.
#[async_trait]
pub trait Broadcast: Send + Sync {
    /// Deliver one payload to every registered destination. Per-destination
    /// failures are contained inside the implementation.
    async fn broadcast(&self, payload: &[u8]);
}

type WsWriteHalf = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReadHalf = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Production connector speaking WebSocket over TCP/TLS.
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl UpstreamConnector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), UpstreamError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| UpstreamError::Handshake(e.to_string()))?;
        if !token.is_empty() {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| UpstreamError::Handshake("bearer token is not a valid header value".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| UpstreamError::Timeout)?
            .map_err(|e| UpstreamError::Handshake(e.to_string()))?;

        let (sink, stream) = ws.split();
        Ok((Box::new(WsSink { sink }), Box::new(WsStream { stream })))
    }
}

struct WsSink {
    sink: WsWriteHalf,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_binary(&mut self, payload: &[u8]) -> Result<(), UpstreamError> {
        self.sink
            .send(Message::Binary(payload.to_vec().into()))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

struct WsStream {
    stream: WsReadHalf,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn recv(&mut self) -> Result<Inbound, UpstreamError> {
        match self.stream.next().await {
            Some(Ok(Message::Binary(data))) => Ok(Inbound::Binary(data.to_vec())),
            Some(Ok(Message::Close(_))) | None => Err(UpstreamError::Closed),
            Some(Ok(_)) => Ok(Inbound::Other),
            Some(Err(e)) => Err(UpstreamError::Transport(e.to_string())),
        }
    }
}

/// The upstream connection owner.
///
/// At most one session is live at any instant. All outbound writes go through
/// [`UpstreamLink::send_frame`], which serializes them on the sink lock.
pub struct UpstreamLink {
    connector: Arc<dyn UpstreamConnector>,
    url: String,
    token: String,
    connect_timeout: Duration,
    sink: Mutex<Option<Box<dyn FrameSink>>>,
    // Gate bookkeeping is deliberately a separate lock from the sink slot so
    // writers never block on failure accounting.
    gate: Mutex<FailureGate>,
    events: EventSender,
}

impl UpstreamLink {
    /// Create a link that is not yet connected.
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        url: impl Into<String>,
        token: impl Into<String>,
        connect_timeout: Duration,
        gate: FailureGate,
        events: EventSender,
    ) -> Self {
        Self {
            connector,
            url: url.into(),
            token: token.into(),
            connect_timeout,
            sink: Mutex::new(None),
            gate: Mutex::new(gate),
            events,
        }
    }

    /// Open the initial session. The caller gets the read half to drive
    /// [`UpstreamLink::read_loop`].
    ///
    /// # Errors
    ///
    /// Fails fast on handshake rejection or timeout; the caller treats this
    /// as fatal at startup.
    pub async fn connect(&self) -> Result<Box<dyn FrameStream>, UpstreamError> {
        tracing::info!(url = %self.url, "connecting upstream");
        let (sink, stream) = self
            .connector
            .connect(&self.url, &self.token, self.connect_timeout)
            .await?;
        *self.sink.lock().await = Some(sink);
        tracing::info!("upstream connected");
        self.events.emit(RelayEvent::UpstreamConnected);
        Ok(stream)
    }

    /// Send one payload as one binary message.
    ///
    /// # Errors
    ///
    /// `UpstreamError::NotConnected` when no session is active; otherwise the
    /// underlying transport error.
    pub async fn send_frame(&self, payload: &[u8]) -> Result<(), UpstreamError> {
        let mut slot = self.sink.lock().await;
        match slot.as_mut() {
            Some(sink) => sink.send_binary(payload).await,
            None => Err(UpstreamError::NotConnected),
        }
    }

    /// Close the active session, if any.
    pub async fn shutdown(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            sink.close().await;
        }
    }

    /// Gate state and consecutive failure count, for observers.
    pub async fn gate_snapshot(&self) -> (GateState, u32) {
        let gate = self.gate.lock().await;
        (gate.state(), gate.failure_count())
    }

    /// Run the inbound read loop until shutdown.
    ///
    /// Every binary message resets the gate and is broadcast verbatim to all
    /// `targets`; non-binary messages are discarded. A read failure starts
    /// the recovery procedure: gate-dictated wait, then reconnect, repeating
    /// until a session is re-established or shutdown is signalled.
    pub async fn read_loop(
        &self,
        mut reader: Box<dyn FrameStream>,
        targets: Vec<Arc<dyn Broadcast>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let inbound = tokio::select! {
                _ = shutdown.changed() => return,
                inbound = reader.recv() => inbound,
            };

            match inbound {
                Ok(Inbound::Binary(payload)) => {
                    self.note_success().await;
                    for target in &targets {
                        target.broadcast(&payload).await;
                    }
                }
                Ok(Inbound::Other) => {
                    tracing::trace!("ignoring non-binary upstream message");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "upstream read failed");
                    self.events.emit(RelayEvent::UpstreamDisconnected);
                    self.note_failure().await;
                    match self.recover(&mut shutdown).await {
                        Some(next) => reader = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Reconnect until a session is established. Returns `None` when shutdown
    /// interrupts the procedure.
    async fn recover(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Box<dyn FrameStream>> {
        let mut attempt: u32 = 0;
        loop {
            let decision = self.gate.lock().await.ready_to_retry(Instant::now());
            if let Retry::Wait(delay) = decision {
                tracing::info!(wait = ?delay, "gate holding reconnect");
                tokio::select! {
                    _ = shutdown.changed() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            attempt += 1;
            self.events.emit(RelayEvent::Reconnecting { attempt });
            match self.reconnect().await {
                Ok(reader) => return Some(reader),
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "reconnect attempt failed");
                    self.note_failure().await;
                }
            }
        }
    }

    /// Swap in a new session under the sink lock, closing the old handle
    /// first. A successful handshake does not touch the gate; only delivered
    /// data does.
    async fn reconnect(&self) -> Result<Box<dyn FrameStream>, UpstreamError> {
        let mut slot = self.sink.lock().await;
        if let Some(mut old) = slot.take() {
            old.close().await;
        }

        let (sink, stream) = self
            .connector
            .connect(&self.url, &self.token, self.connect_timeout)
            .await?;
        *slot = Some(sink);
        tracing::info!("upstream reconnected");
        self.events.emit(RelayEvent::UpstreamConnected);
        Ok(stream)
    }

    async fn note_success(&self) {
        let closed = self.gate.lock().await.record_success();
        if closed {
            tracing::info!("upstream data flowing again, gate closed");
            self.events.emit(RelayEvent::GateClosed);
        }
    }

    async fn note_failure(&self) {
        let cooldown = {
            let mut gate = self.gate.lock().await;
            gate.record_failure(Instant::now()).then(|| gate.cooldown())
        };
        if let Some(cooldown) = cooldown {
            tracing::warn!(?cooldown, "failure threshold reached, gate opened");
            self.events.emit(RelayEvent::GateOpened { cooldown });
        }
    }
}
