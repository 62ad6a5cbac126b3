//! WebSocket client: connect, relay frames, keep alive, reconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::bridge::channels::SocketChannels;
use crate::common::error::{SocketError, SocketResult};
use crate::common::messages::{Direction, Message};
use crate::socket::auth::{connect_url, Credentials};
use crate::socket::supervisor::{ConnectionSupervisor, DisconnectCause, Verdict};
use crate::telemetry::BridgeMetrics;

/// Keepalive intervals without inbound traffic before a connection is dead.
const KEEPALIVE_MISSES: u32 = 2;

/// Opens WebSocket connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn connect(&self) -> SocketResult<WebSocketStream<Self::Stream>>;
}

/// Connects to the WebSocket API with a freshly signed URL each time.
pub struct WsConnector {
    credentials: Credentials,
}

impl WsConnector {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Stream = MaybeTlsStream<TcpStream>;

    async fn connect(&self) -> SocketResult<WebSocketStream<Self::Stream>> {
        let url = connect_url(&self.credentials)?;
        debug!("Opening WebSocket to {}", self.credentials.endpoint());

        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| SocketError::Handshake {
                message: e.to_string(),
            })?;
        Ok(stream)
    }
}

/// A message for the socket plus where to report the hand-off result.
#[derive(Debug)]
pub struct SocketRequest {
    pub message: Message,
    pub reply: oneshot::Sender<SocketResult<()>>,
}

/// How one connection ended.
enum Served {
    Shutdown,
    Lost(DisconnectCause),
}

type WsSink<S> = SplitSink<WebSocketStream<S>, WsMessage>;

pub struct SocketClient<C: Connector> {
    connector: C,
    supervisor: Arc<ConnectionSupervisor>,
    channels: SocketChannels,
    ping_interval: Duration,
    metrics: Arc<BridgeMetrics>,
}

impl<C: Connector> SocketClient<C> {
    pub fn new(
        connector: C,
        supervisor: Arc<ConnectionSupervisor>,
        channels: SocketChannels,
        ping_interval: Duration,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            connector,
            supervisor,
            channels,
            ping_interval: ping_interval.max(Duration::from_millis(1)),
            metrics,
        }
    }

    /// Connect and serve until shutdown or a fatal error.
    ///
    /// Fails when the very first handshake fails or when the supervisor's
    /// attempt budget runs out.
    pub async fn run(mut self) -> SocketResult<()> {
        let mut shutdown_rx = self.channels.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let id = self.supervisor.connect()?;

            let attempt = tokio::select! {
                result = self.connector.connect() => result,
                _ = shutdown_rx.changed() => break,
            };

            let cause = match attempt {
                Ok(stream) => {
                    self.supervisor.on_connected(id);
                    match self.serve(stream).await {
                        Served::Shutdown => break,
                        Served::Lost(cause) => cause,
                    }
                }
                Err(e) if !self.supervisor.has_connected() => {
                    error!("Initial WebSocket handshake failed: {}", e);
                    self.supervisor.abort();
                    return Err(SocketError::InitialHandshake {
                        message: e.to_string(),
                    });
                }
                Err(e) => DisconnectCause::HandshakeFailed(e.to_string()),
            };

            match self.supervisor.on_disconnected(id, cause) {
                Verdict::Fatal { failures } => {
                    return Err(SocketError::AttemptBudgetExhausted {
                        failures,
                        window_secs: self.supervisor.window_secs(),
                    });
                }
                Verdict::Reconnect { .. } | Verdict::Ignored => {}
            }
        }

        self.supervisor.shutdown();
        info!("WebSocket client stopped");
        Ok(())
    }

    async fn serve(&mut self, stream: WebSocketStream<C::Stream>) -> Served {
        let (mut sink, mut stream) = stream.split();
        let mut shutdown_rx = self.channels.shutdown_rx.clone();

        let mut keepalive = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let dead_after = self.ping_interval * KEEPALIVE_MISSES;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            last_seen = Instant::now();
                            self.forward(Bytes::from(text)).await;
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            last_seen = Instant::now();
                            self.forward(Bytes::from(data)).await;
                        }
                        Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {
                            last_seen = Instant::now();
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .filter(|r| !r.is_empty());
                            return Served::Lost(DisconnectCause::RemoteClose(reason));
                        }
                        Some(Ok(WsMessage::Frame(_))) => {}
                        Some(Err(e)) => {
                            return Served::Lost(DisconnectCause::SocketError(e.to_string()));
                        }
                        None => return Served::Lost(DisconnectCause::RemoteClose(None)),
                    }
                }

                _ = keepalive.tick() => {
                    if last_seen.elapsed() >= dead_after {
                        return Served::Lost(DisconnectCause::KeepaliveTimeout);
                    }
                    if let Err(e) = send_keepalive(&mut sink).await {
                        return Served::Lost(DisconnectCause::SocketError(e.to_string()));
                    }
                }

                request = self.channels.to_socket_rx.recv() => {
                    let Some(request) = request else {
                        debug!("Router hung up; closing WebSocket");
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return Served::Shutdown;
                    };
                    if let Err(cause) = self.deliver(&mut sink, request).await {
                        return Served::Lost(cause);
                    }
                }

                _ = shutdown_rx.changed() => {
                    info!("Closing WebSocket");
                    if let Err(e) = sink.send(WsMessage::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    return Served::Shutdown;
                }
            }
        }
    }

    /// Write one hand-off to the socket and report the result.
    async fn deliver(
        &self,
        sink: &mut WsSink<C::Stream>,
        request: SocketRequest,
    ) -> Result<(), DisconnectCause> {
        // The router gave up waiting; it has already requeued this message.
        if request.reply.is_closed() {
            debug!("Dropping abandoned hand-off");
            return Ok(());
        }

        let payload = request.message.payload().clone();
        let frame = match String::from_utf8(payload.to_vec()) {
            Ok(text) => WsMessage::Text(text),
            Err(_) => WsMessage::Binary(payload.to_vec()),
        };

        match sink.send(frame).await {
            Ok(()) => {
                self.metrics.record_to_ws();
                debug!(
                    correlation_id = request.message.correlation_id(),
                    "Sent message to WebSocket"
                );
                let _ = request.reply.send(Ok(()));
                Ok(())
            }
            Err(e) => {
                let _ = request.reply.send(Err(SocketError::Send {
                    message: e.to_string(),
                }));
                Err(DisconnectCause::SocketError(e.to_string()))
            }
        }
    }

    async fn forward(&self, payload: Bytes) {
        self.metrics.record_from_ws();
        let message = Message::new(Direction::FromSocket, payload);
        debug!(
            correlation_id = message.correlation_id(),
            "Received message from WebSocket"
        );
        if self.channels.from_socket_tx.send(message).await.is_err() {
            warn!("Outbound publisher is gone; dropping WebSocket message");
            self.metrics.record_lost();
        }
    }
}

/// Periodic ping driven by the keepalive timer.
pub async fn send_keepalive<S>(sink: &mut WsSink<S>) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    debug!("Sending WebSocket keepalive ping");
    sink.send(WsMessage::Ping(Vec::new())).await
}
