//! Message routing between the queues and the WebSocket.
//!
//! The inbound task pulls from the to-socket queue and, in bridge mode, hands
//! each message to the socket client only while the connection is up. A
//! delivery is acked after the socket accepted it and requeued otherwise. The
//! outbound task publishes whatever the socket receives. In stub mode the
//! inbound task republishes straight to the outbound queue instead.

use std::sync::Arc;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::common::error::{GatewayError, GatewayResult, SocketError, SocketResult};
use crate::common::messages::{Direction, Message};
use crate::gateway::{Deliveries, Delivery, QueueGateway};
use crate::socket::{ConnectionState, SocketRequest};
use crate::telemetry::BridgeMetrics;

/// Router tuning.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub inbound_queue: String,
    pub outbound_queue: String,
    /// Unacked inbound deliveries held at once.
    pub prefetch: u16,
    /// Upper bound on waiting for the socket to accept one message.
    pub hand_off_timeout: Duration,
    /// Publish retries after the first failed attempt.
    pub publish_retries: usize,
    pub publish_retry_delay: Duration,
}

impl RouterConfig {
    pub fn new(inbound_queue: impl Into<String>, outbound_queue: impl Into<String>) -> Self {
        Self {
            inbound_queue: inbound_queue.into(),
            outbound_queue: outbound_queue.into(),
            prefetch: 16,
            hand_off_timeout: Duration::from_secs(10),
            publish_retries: 4,
            publish_retry_delay: Duration::from_secs(1),
        }
    }
}

/// Router's end of the socket client.
pub struct SocketLink {
    pub to_socket_tx: mpsc::Sender<SocketRequest>,
    pub from_socket_rx: mpsc::Receiver<Message>,
    pub state_rx: watch::Receiver<ConnectionState>,
}

pub enum RouterMode {
    Bridge(SocketLink),
    /// Loop inbound to outbound without a socket.
    Stub,
}

impl RouterMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Bridge(_) => "bridge",
            Self::Stub => "stub",
        }
    }
}

enum InboundSink {
    Socket {
        to_socket_tx: mpsc::Sender<SocketRequest>,
        state_rx: watch::Receiver<ConnectionState>,
    },
    Outbound,
}

pub struct MessageRouter {
    gateway: Arc<QueueGateway>,
    config: RouterConfig,
    metrics: Arc<BridgeMetrics>,
}

impl MessageRouter {
    pub fn new(gateway: Arc<QueueGateway>, config: RouterConfig, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            gateway,
            config,
            metrics,
        }
    }

    /// Bind the inbound consumer and spawn the routing tasks.
    ///
    /// A bind failure is returned before anything is spawned.
    pub async fn start(self, mode: RouterMode) -> GatewayResult<RouterHandle> {
        let deliveries = self
            .gateway
            .consume(&self.config.inbound_queue, self.config.prefetch)
            .await?;
        info!(
            "Router started in {} mode ({} -> {})",
            mode.name(),
            self.config.inbound_queue,
            self.config.outbound_queue
        );

        let router = Arc::new(self);
        let (stop_tx, stop_rx) = watch::channel(false);

        let (sink, outbound) = match mode {
            RouterMode::Bridge(link) => {
                let outbound = tokio::spawn(
                    router
                        .clone()
                        .run_outbound(link.from_socket_rx)
                        .in_current_span(),
                );
                let sink = InboundSink::Socket {
                    to_socket_tx: link.to_socket_tx,
                    state_rx: link.state_rx,
                };
                (sink, Some(outbound))
            }
            RouterMode::Stub => (InboundSink::Outbound, None),
        };

        let inbound_queue = router.config.inbound_queue.clone();
        let inbound = tokio::spawn(
            router
                .run_inbound(deliveries, sink, stop_rx)
                .in_current_span(),
        );

        Ok(RouterHandle {
            inbound_queue,
            stop_tx,
            inbound: Some(inbound),
            outbound,
        })
    }

    async fn run_inbound(
        self: Arc<Self>,
        mut deliveries: Deliveries,
        mut sink: InboundSink,
        mut stop_rx: watch::Receiver<bool>,
    ) -> GatewayResult<()> {
        let mut outcome = Ok(());
        loop {
            if let InboundSink::Socket { state_rx, .. } = &mut sink {
                if !self.wait_until_connected(state_rx, &mut stop_rx).await {
                    break;
                }
            }

            let delivery = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        error!("Inbound consumer on '{}' closed", self.config.inbound_queue);
                        outcome = Err(GatewayError::ConsumerClosed {
                            queue: self.config.inbound_queue.clone(),
                        });
                        break;
                    }
                },
            };

            match &sink {
                InboundSink::Socket { to_socket_tx, .. } => {
                    self.hand_off(delivery, to_socket_tx).await;
                }
                InboundSink::Outbound => self.relay_stub(delivery).await,
            }
        }

        if let Err(e) = self.gateway.cancel(&self.config.inbound_queue).await {
            warn!("Failed to cancel inbound consumer: {}", e);
        }
        // Return anything prefetched but not yet routed.
        while let Ok(delivery) = deliveries.try_recv() {
            settle(delivery, Settle::Requeue).await;
        }
        debug!("Inbound routing stopped");
        outcome
    }

    /// Hold consumption until the socket is connected. Returns `false` on
    /// stop or terminal failure.
    async fn wait_until_connected(
        &self,
        state_rx: &mut watch::Receiver<ConnectionState>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut paused = false;

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => {
                    if paused {
                        info!("WebSocket connected; resuming inbound consumption");
                    }
                    return true;
                }
                ConnectionState::Failed => return false,
                _ => {}
            }

            if !paused {
                paused = true;
                self.metrics.record_pause();
                info!("WebSocket is {}; pausing inbound consumption", state);
            }

            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = stop_rx.changed() => return false,
            }
        }
    }

    async fn hand_off(&self, delivery: Delivery, to_socket_tx: &mpsc::Sender<SocketRequest>) {
        let message = delivery.to_message(Direction::ToSocket);
        let correlation_id = message.correlation_id().map(str::to_string);
        let timeout = self.config.hand_off_timeout;

        let result = tokio::time::timeout(timeout, request_send(to_socket_tx, message))
            .await
            .unwrap_or(Err(SocketError::HandOffTimeout {
                millis: timeout.as_millis() as u64,
            }));

        match result {
            Ok(()) => settle(delivery, Settle::Ack).await,
            Err(e) => {
                warn!(
                    correlation_id = correlation_id.as_deref(),
                    "Hand-off to WebSocket failed: {}; requeueing", e
                );
                settle(delivery, Settle::Requeue).await;
            }
        }
    }

    async fn relay_stub(&self, delivery: Delivery) {
        let message = delivery.to_message(Direction::FromSocket);
        match self.publish_with_retry(&message).await {
            Ok(()) => settle(delivery, Settle::Ack).await,
            Err(e) => {
                error!("Stub relay failed: {}; requeueing", e);
                settle(delivery, Settle::Requeue).await;
            }
        }
    }

    async fn run_outbound(self: Arc<Self>, mut from_socket_rx: mpsc::Receiver<Message>) {
        while let Some(message) = from_socket_rx.recv().await {
            if let Err(e) = self.publish_with_retry(&message).await {
                self.metrics.record_lost();
                error!(
                    correlation_id = message.correlation_id(),
                    "Message from WebSocket lost after {} attempts: {}",
                    self.config.publish_retries + 1,
                    e
                );
            }
        }
        debug!("Outbound routing stopped");
    }

    async fn publish_with_retry(&self, message: &Message) -> GatewayResult<()> {
        let queue = self.config.outbound_queue.as_str();
        let policy = ConstantBuilder::default()
            .with_delay(self.config.publish_retry_delay)
            .with_max_times(self.config.publish_retries);

        (|| async { self.gateway.publish(queue, message).await })
            .retry(policy)
            .sleep(tokio::time::sleep)
            .notify(|e, delay| {
                warn!(
                    "Publish to '{}' failed: {}; retrying in {:.1}s",
                    queue,
                    e,
                    delay.as_secs_f64()
                );
            })
            .await
    }
}

/// Queue a message for the socket and wait for its verdict.
async fn request_send(to_socket_tx: &mpsc::Sender<SocketRequest>, message: Message) -> SocketResult<()> {
    let (reply, verdict) = oneshot::channel();
    to_socket_tx
        .send(SocketRequest { message, reply })
        .await
        .map_err(|_| SocketError::ShutDown)?;
    verdict.await.map_err(|_| SocketError::NotConnected)?
}

enum Settle {
    Ack,
    Requeue,
}

async fn settle(delivery: Delivery, how: Settle) {
    let tag = delivery.delivery_tag;
    let result = match how {
        Settle::Ack => delivery.ack().await,
        Settle::Requeue => delivery.reject(true).await,
    };
    if let Err(e) = result {
        warn!("Failed to settle delivery {}: {}", tag, e);
    }
}

/// Running router.
pub struct RouterHandle {
    inbound_queue: String,
    stop_tx: watch::Sender<bool>,
    inbound: Option<JoinHandle<GatewayResult<()>>>,
    outbound: Option<JoinHandle<()>>,
}

impl RouterHandle {
    /// Stop consuming. Waits for an in-flight hand-off to finish or time out.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(inbound) = self.inbound.take() {
            match inbound.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Inbound routing had already ended: {}", e),
                Err(e) => warn!("Inbound routing task panicked: {}", e),
            }
        }
    }

    /// Resolve if inbound routing ends on its own with an error, such as the
    /// broker closing the consumer. Stays pending otherwise.
    pub async fn inbound_failed(&mut self) -> GatewayError {
        let Some(inbound) = self.inbound.as_mut() else {
            return std::future::pending().await;
        };
        let result = inbound.await;
        self.inbound = None;
        match result {
            Ok(Ok(())) => std::future::pending().await,
            Ok(Err(e)) => e,
            Err(e) => {
                error!("Inbound routing task panicked: {}", e);
                GatewayError::ConsumerClosed {
                    queue: self.inbound_queue.clone(),
                }
            }
        }
    }

    /// Stop, then wait for the outbound publisher to drain. The publisher
    /// ends once the socket side hangs up.
    pub async fn join(mut self) {
        self.stop().await;
        if let Some(outbound) = self.outbound.take() {
            if let Err(e) = outbound.await {
                warn!("Outbound routing task panicked: {}", e);
            }
        }
    }
}
