//! Bridge lifecycle: wire the gateway, router and socket client together,
//! run until told to stop, then shut down in order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::bridge::channels::{ChannelBundle, ControlChannels};
use crate::bridge::router::{MessageRouter, RouterConfig, RouterHandle, RouterMode, SocketLink};
use crate::common::error::{Result, SocketError, SocketResult};
use crate::config::Settings;
use crate::gateway::{Broker, QueueBinding, QueueGateway};
use crate::socket::{ConnectionSupervisor, Connector, SocketClient};
use crate::telemetry::{BridgeMetrics, MetricsReporter, MetricsSink};

/// Slots per direction between the router and the socket client.
const CHANNEL_CAPACITY: usize = 32;
/// Upper bound on each shutdown step.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type SocketTask = JoinHandle<SocketResult<()>>;

pub struct Bridge {
    settings: Settings,
    gateway: Arc<QueueGateway>,
    metrics: Arc<BridgeMetrics>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
}

impl Bridge {
    pub fn new(settings: Settings, broker: Arc<dyn Broker>, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            settings,
            gateway: Arc::new(QueueGateway::new(broker)),
            metrics,
            metrics_sink: None,
        }
    }

    /// Report metrics to `sink` while running.
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    /// Run until `shutdown` resolves, `run_for` elapses, the socket fails
    /// for good or the broker drops the inbound consumer. Without a connector
    /// the router runs in stub mode.
    pub async fn run<C, F>(self, connector: Option<C>, run_for: Option<Duration>, shutdown: F) -> Result<()>
    where
        C: Connector,
        F: Future<Output = ()>,
    {
        let broker = &self.settings.broker;
        let inbound = QueueBinding::new(&broker.queue_to_socket, &broker.consumer_tag)?;
        let outbound = QueueBinding::new(&broker.queue_from_socket, &broker.consumer_tag)?
            .with_ttl(broker.ttl_from_socket_ms);
        self.gateway.ensure_queue(&inbound).await?;
        self.gateway.ensure_queue(&outbound).await?;

        let ChannelBundle {
            socket,
            router,
            control,
        } = ChannelBundle::new(CHANNEL_CAPACITY);

        let router_config = RouterConfig::new(inbound.name(), outbound.name());
        let message_router = MessageRouter::new(self.gateway.clone(), router_config, self.metrics.clone());

        let (mut router_handle, mut socket_task) = match connector {
            Some(connector) => {
                let ws = &self.settings.socket;
                let supervisor = Arc::new(ConnectionSupervisor::new(
                    ws.max_connect_attempts,
                    ws.attempt_window(),
                    self.metrics.clone(),
                ));
                let link = SocketLink {
                    to_socket_tx: router.to_socket_tx,
                    from_socket_rx: router.from_socket_rx,
                    state_rx: supervisor.subscribe(),
                };
                let handle = message_router.start(RouterMode::Bridge(link)).await?;

                let client = SocketClient::new(
                    connector,
                    supervisor,
                    socket,
                    ws.ping_interval(),
                    self.metrics.clone(),
                );
                (handle, Some(tokio::spawn(client.run().in_current_span())))
            }
            None => (message_router.start(RouterMode::Stub).await?, None),
        };

        let (reporter_stop_tx, reporter_stop_rx) = watch::channel(false);
        let reporter = self.metrics_sink.clone().map(|sink| {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                sink,
                self.settings.observability.metrics_resolution(),
            );
            tokio::spawn(reporter.run(reporter_stop_rx).in_current_span())
        });

        info!(
            "Bridge running ({} -> socket -> {})",
            inbound.name(),
            outbound.name()
        );

        let run_timer = async {
            match run_for {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(run_timer);
        tokio::pin!(shutdown);

        let outcome = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            _ = &mut run_timer => {
                info!("Run duration elapsed");
                Ok(())
            }
            result = join_socket(&mut socket_task) => result,
            e = router_handle.inbound_failed() => Err(e.into()),
        };

        if let Err(e) = &outcome {
            error!("Bridge failed: {}", e);
        }

        stop_in_order(router_handle, control, socket_task).await;

        let _ = reporter_stop_tx.send(true);
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                warn!("Metrics reporter panicked: {}", e);
            }
        }

        if let Err(e) = self.gateway.close().await {
            warn!("Failed to close broker connection: {}", e);
        }
        info!("Bridge stopped");
        outcome
    }
}

/// Stop consuming, close the socket, then let outbound publishing drain.
async fn stop_in_order(mut router: RouterHandle, control: ControlChannels, socket_task: Option<SocketTask>) {
    router.stop().await;

    let _ = control.shutdown_tx.send(true);
    if let Some(task) = socket_task {
        match tokio::time::timeout(JOIN_TIMEOUT, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("WebSocket client ended with: {}", e),
            Ok(Err(e)) => warn!("WebSocket task panicked: {}", e),
            Err(_) => warn!("WebSocket client did not stop in time"),
        }
    }

    if tokio::time::timeout(JOIN_TIMEOUT, router.join()).await.is_err() {
        warn!("Outbound publishing did not drain in time");
    }
}

/// Resolve when the socket task ends. Never resolves without one.
async fn join_socket(task: &mut Option<SocketTask>) -> Result<()> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let result = handle.await;
    *task = None;
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => {
            error!("WebSocket task panicked: {}", e);
            Err(SocketError::ShutDown.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::{AppError, GatewayError};
    use crate::config::MemorySource;
    use crate::gateway::MemoryBroker;
    use crate::socket::client::tests::{DuplexConnector, Endpoint};
    use tokio::sync::oneshot;

    const TO_WS: &str = "to_ws";
    const FROM_WS: &str = "from_ws";

    fn settings(max_attempts: usize) -> Settings {
        let source = MemorySource::new("test")
            .with("ws_api", "client_id", "client-1")
            .with("ws_api", "client_secret", "00ff")
            .with("ws_api", "api_host", "wss://api.example.com")
            .with("ws_api", "api_uri", "/v1/stream")
            .with("ws_api", "ws_max_connect_attempts", max_attempts.to_string())
            .with("aws_mq", "mq_broker_id", "b-1")
            .with("aws_mq", "mq_user_id", "bridge")
            .with("aws_mq", "mq_password", "secret")
            .with("aws_mq", "mq_qname_to_ws", TO_WS)
            .with("aws_mq", "mq_qname_from_ws", FROM_WS)
            .with("aws_mq", "mq_ttl_from_ws", "60000");
        Settings::from_source(&source).unwrap()
    }

    fn bridge(max_attempts: usize) -> (Bridge, MemoryBroker, Arc<BridgeMetrics>) {
        let broker = MemoryBroker::new();
        let metrics = BridgeMetrics::new();
        let bridge = Bridge::new(settings(max_attempts), Arc::new(broker.clone()), metrics.clone());
        (bridge, broker, metrics)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_stub_mode_echoes_with_ttl() {
        let (bridge, broker, _metrics) = bridge(3);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(bridge.run::<DuplexConnector, _>(None, None, async move {
            let _ = stop_rx.await;
        }));

        eventually(|| broker.consumer_count(TO_WS) == 1).await;
        let body = r#"{"id":"m1","payload":"hello"}"#;
        broker.push(TO_WS, body);

        eventually(|| broker.published(FROM_WS).len() == 1).await;
        let echoed = &broker.published(FROM_WS)[0];
        assert_eq!(echoed.payload, bytes::Bytes::from(body));
        assert_eq!(echoed.properties.expiration_ms, Some(60_000));
        assert_eq!(echoed.properties.correlation_id.as_deref(), Some("m1"));

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(broker.acked_count(TO_WS), 1);
        assert_eq!(broker.ready_count(TO_WS), 0);
    }

    #[tokio::test]
    async fn test_bridge_mode_round_trip() {
        let (bridge, broker, metrics) = bridge(3);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let connector = DuplexConnector::new(Endpoint::Echo);
        let task = tokio::spawn(bridge.run(Some(connector), None, async move {
            let _ = stop_rx.await;
        }));

        eventually(|| broker.is_declared(TO_WS)).await;
        broker.push(TO_WS, r#"{"id":"m7"}"#);

        eventually(|| broker.published(FROM_WS).len() == 1).await;
        let echoed = &broker.published(FROM_WS)[0];
        assert_eq!(echoed.properties.correlation_id.as_deref(), Some("m7"));
        assert_eq!(echoed.properties.app_id.as_deref(), Some("mqhandler"));
        assert_eq!(echoed.properties.expiration_ms, Some(60_000));

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(broker.acked_count(TO_WS), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.to_ws, 1);
        assert_eq!(snapshot.from_ws, 1);
        assert_eq!(snapshot.messages_lost, 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_stops_the_bridge() {
        let (bridge, broker, _metrics) = bridge(3);
        let connector = DuplexConnector::new(Endpoint::HangUp);
        let attempts = connector.attempts.clone();

        let err = bridge
            .run(Some(connector), None, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Socket(SocketError::AttemptBudgetExhausted { failures: 3, .. })
        ));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(broker.declare_queue("after").await.is_err());
    }

    #[tokio::test]
    async fn test_first_handshake_failure_is_startup_fatal() {
        let (bridge, broker, _metrics) = bridge(10);
        broker.push(TO_WS, "untouched");
        let mut connector = DuplexConnector::new(Endpoint::Echo);
        connector.refuse_first = 1;

        let err = bridge
            .run(Some(connector), None, std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Socket(SocketError::InitialHandshake { .. })));
        assert_eq!(broker.acked_count(TO_WS), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_duration_ends_an_idle_bridge() {
        let (bridge, broker, _metrics) = bridge(3);

        bridge
            .run::<DuplexConnector, _>(None, Some(Duration::from_secs(60)), std::future::pending())
            .await
            .unwrap();

        assert_eq!(broker.consumer_count(TO_WS), 0);
        assert!(broker.declare_queue("after").await.is_err());
    }

    #[tokio::test]
    async fn test_lost_inbound_consumer_stops_the_bridge() {
        let (bridge, broker, _metrics) = bridge(3);
        let task = tokio::spawn(bridge.run::<DuplexConnector, _>(None, None, std::future::pending()));
        eventually(|| broker.consumer_count(TO_WS) == 1).await;

        broker.cancel("mqhandler").await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::Gateway(GatewayError::ConsumerClosed { ref queue }) if queue == TO_WS
        ));
        assert!(broker.declare_queue("after").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_consumer_tag_fails_startup() {
        let broker = MemoryBroker::new();
        let first = Bridge::new(settings(3), Arc::new(broker.clone()), BridgeMetrics::new());
        let second = Bridge::new(settings(3), Arc::new(broker.clone()), BridgeMetrics::new());

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(first.run::<DuplexConnector, _>(None, None, async move {
            let _ = stop_rx.await;
        }));
        eventually(|| broker.consumer_count(TO_WS) == 1).await;

        let err = second
            .run::<DuplexConnector, _>(None, None, std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Gateway(_)));

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}
