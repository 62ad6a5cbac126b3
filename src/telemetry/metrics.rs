//! Bridge counters and the periodic reporter that publishes them.
//!
//! Counters are plain atomics shared by every task. The reporter samples them
//! at the configured resolution and emits totals, recent deltas and
//! per-second rates through a [`MetricsSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Shared bridge counters.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    mq_connection_attempts: AtomicU64,
    ws_connection_attempts: AtomicU64,
    to_ws: AtomicU64,
    from_ws: AtomicU64,
    messages_lost: AtomicU64,
    router_pauses: AtomicU64,
}

impl BridgeMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_mq_attempt(&self) {
        self.mq_connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ws_attempt(&self) {
        self.ws_connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_to_ws(&self) {
        self.to_ws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_from_ws(&self) {
        self.from_ws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lost(&self) {
        self.messages_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pause(&self) {
        self.router_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            mq_connection_attempts: self.mq_connection_attempts.load(Ordering::Relaxed),
            ws_connection_attempts: self.ws_connection_attempts.load(Ordering::Relaxed),
            to_ws: self.to_ws.load(Ordering::Relaxed),
            from_ws: self.from_ws.load(Ordering::Relaxed),
            messages_lost: self.messages_lost.load(Ordering::Relaxed),
            router_pauses: self.router_pauses.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub mq_connection_attempts: u64,
    pub ws_connection_attempts: u64,
    pub to_ws: u64,
    pub from_ws: u64,
    pub messages_lost: u64,
    pub router_pauses: u64,
}

/// Destination for named numeric samples.
pub trait MetricsSink: Send + Sync {
    fn record(&self, name: &str, value: f64);
}

/// Sink that forwards samples to the `metrics` facade as gauges labelled with
/// the configured namespace.
#[derive(Debug, Clone)]
pub struct FacadeSink {
    namespace: String,
}

impl FacadeSink {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl MetricsSink for FacadeSink {
    fn record(&self, name: &str, value: f64) {
        metrics::gauge!(name.to_string(), "namespace" => self.namespace.clone()).set(value);
        debug!(namespace = %self.namespace, metric = name, value, "metric sample");
    }
}

/// Samples [`BridgeMetrics`] and emits derived values.
pub struct MetricsReporter {
    metrics: Arc<BridgeMetrics>,
    sink: Arc<dyn MetricsSink>,
    resolution: Duration,
    last: MetricsSnapshot,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<BridgeMetrics>, sink: Arc<dyn MetricsSink>, resolution: Duration) -> Self {
        Self {
            metrics,
            sink,
            resolution: resolution.max(Duration::from_secs(1)),
            last: MetricsSnapshot::default(),
        }
    }

    /// Take one sample and return every emitted `(name, value)` pair.
    pub fn sample(&mut self) -> Vec<(&'static str, f64)> {
        let now = self.metrics.snapshot();
        let last = std::mem::replace(&mut self.last, now);
        let secs = self.resolution.as_secs_f64();

        let samples = vec![
            ("mq_connection_attempts_total", now.mq_connection_attempts as f64),
            (
                "mq_connection_attempts_recent",
                (now.mq_connection_attempts - last.mq_connection_attempts) as f64,
            ),
            ("ws_connection_attempts_total", now.ws_connection_attempts as f64),
            (
                "ws_connection_attempts_recent",
                (now.ws_connection_attempts - last.ws_connection_attempts) as f64,
            ),
            ("to_ws_total", now.to_ws as f64),
            ("to_ws_persecond", (now.to_ws - last.to_ws) as f64 / secs),
            ("from_ws_total", now.from_ws as f64),
            ("from_ws_persecond", (now.from_ws - last.from_ws) as f64 / secs),
            ("messages_lost_total", now.messages_lost as f64),
            ("router_pauses_total", now.router_pauses as f64),
        ];

        for (name, value) in &samples {
            self.sink.record(name, *value);
        }
        samples
    }

    /// Sample every resolution period until shutdown, then once more.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            "Metrics reporter started (resolution {}s)",
            self.resolution.as_secs()
        );
        let mut ticker = interval_at(Instant::now() + self.resolution, self.resolution);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sample();
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            }
        }

        self.sample();
        debug!("Metrics reporter stopped");
    }
}
