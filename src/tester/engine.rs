//! End-to-end delivery check.
//!
//! Publishes numbered probes to the bridge's inbound queue and watches the
//! return queue for them. Every probe ends up reconciled or expired; anything
//! else seen on the return queue is recorded as rejected and, unless the run
//! is exclusive, handed back to the broker for its real consumer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::common::error::TesterError;
use crate::common::messages::{Direction, Message};
use crate::gateway::{Deliveries, Delivery, QueueBinding, QueueGateway};
use crate::tester::display::format_elapsed;
use crate::tester::record::{Ledger, Observation, ReconciliationReport};

/// TTL stamped on every probe.
pub const PROBE_TTL_MS: u64 = 300_000;
pub const PROBE_CONSUMER_TAG: &str = "bridgetester";
const PREFETCH: u16 = 16;
/// Pause before handing back a foreign message seen before, so a lone
/// foreign message does not bounce between broker and engine at full speed.
const FOREIGN_REQUEUE_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct RunParams {
    pub num_messages: usize,
    pub delay_between: Duration,
    /// Hard limit on waiting for returns after the last probe.
    pub end_delay: Duration,
    /// Consume everything on the return queue, ours or not.
    pub exclusive: bool,
    /// Log only about our own probes.
    pub focused: bool,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            num_messages: 8,
            delay_between: Duration::from_secs(1),
            end_delay: Duration::from_secs(30),
            exclusive: false,
            focused: false,
        }
    }
}

pub struct ReconciliationEngine {
    gateway: Arc<QueueGateway>,
    to_queue: String,
    from_queue: String,
    ledger: Mutex<Ledger>,
    feed: watch::Sender<ReconciliationReport>,
}

impl ReconciliationEngine {
    /// `to_queue` is the bridge's inbound queue, `from_queue` its outbound one.
    pub fn new(gateway: Arc<QueueGateway>, to_queue: impl Into<String>, from_queue: impl Into<String>) -> Self {
        let (feed, _) = watch::channel(ReconciliationReport::default());
        Self {
            gateway,
            to_queue: to_queue.into(),
            from_queue: from_queue.into(),
            ledger: Mutex::new(Ledger::default()),
            feed,
        }
    }

    /// Live report, updated on every send and receive.
    pub fn subscribe(&self) -> watch::Receiver<ReconciliationReport> {
        self.feed.subscribe()
    }

    pub async fn run(&self, params: &RunParams) -> Result<ReconciliationReport, TesterError> {
        let outbound = QueueBinding::new(&self.to_queue, PROBE_CONSUMER_TAG)?.with_ttl(PROBE_TTL_MS);
        let inbound = QueueBinding::new(&self.from_queue, PROBE_CONSUMER_TAG)?;
        self.gateway.ensure_queue(&outbound).await?;
        self.gateway.ensure_queue(&inbound).await?;

        *self.ledger.lock() = Ledger::new(params.num_messages);
        self.publish_report();

        let deliveries = self.gateway.consume(&self.from_queue, PREFETCH).await?;
        let run_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        info!(
            "Sending {} probes to '{}', watching '{}' (run {})",
            params.num_messages, self.to_queue, self.from_queue, run_id
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let sending = async {
            let sent = self.send_probes(&run_id, params).await;
            if sent.is_ok() {
                self.await_returns(params.end_delay).await;
            }
            let _ = stop_tx.send(true);
            sent
        };
        let (sent, mut deliveries) = tokio::join!(sending, self.receive(deliveries, params, stop_rx));

        self.ledger.lock().finalize();

        if let Err(e) = self.gateway.cancel(&self.from_queue).await {
            warn!("Failed to cancel consumer: {}", e);
        }
        while let Ok(delivery) = deliveries.try_recv() {
            settle(delivery, Settlement::Requeue).await;
        }

        let report = self.publish_report();
        sent?;
        info!("{}", report.summary_line());
        Ok(report)
    }

    async fn send_probes(&self, run_id: &str, params: &RunParams) -> Result<(), TesterError> {
        for seq in 1..=params.num_messages {
            if seq > 1 && !params.delay_between.is_zero() {
                tokio::time::sleep(params.delay_between).await;
            }

            let id = format!("{}-{:04}", run_id, seq);
            let sent_at = Utc::now();
            let body = serde_json::json!({
                "id": id,
                "seq": seq,
                "sent_at": sent_at.to_rfc3339(),
            });

            self.ledger.lock().register(&id, sent_at, Instant::now());
            let message = Message::new(Direction::ToSocket, body.to_string());
            self.gateway.publish(&self.to_queue, &message).await?;
            self.publish_report();
            info!(">>> Sent probe #{} ({})", seq, id);
        }
        Ok(())
    }

    /// Wait up to `end_delay`, returning early once every probe is back.
    async fn await_returns(&self, end_delay: Duration) {
        let mut feed_rx = self.feed.subscribe();
        let deadline = tokio::time::sleep(end_delay);
        tokio::pin!(deadline);

        loop {
            if self.ledger.lock().all_reconciled() {
                debug!("All probes reconciled");
                return;
            }
            tokio::select! {
                _ = &mut deadline => {
                    info!("End delay elapsed with probes outstanding");
                    return;
                }
                changed = feed_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn receive(&self, mut deliveries: Deliveries, params: &RunParams, mut stop_rx: watch::Receiver<bool>) -> Deliveries {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = stop_rx.changed() => break,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => {
                        warn!("Return queue consumer closed");
                        break;
                    }
                },
            };
            self.handle(delivery, params).await;
        }
        deliveries
    }

    async fn handle(&self, delivery: Delivery, params: &RunParams) {
        let message = delivery.to_message(Direction::FromSocket);
        let id = message.correlation_id().unwrap_or_default().to_string();
        let observation = self.ledger.lock().observe(&id, Utc::now(), Instant::now());
        self.publish_report();

        let settlement = match observation {
            Observation::Matched(latency) => {
                info!("<<< Turnaround time for '{}': {}", id, format_elapsed(latency));
                Settlement::Ack
            }
            Observation::Duplicate => {
                if !params.focused {
                    info!("Duplicate return of '{}'", id);
                }
                if params.exclusive {
                    Settlement::Ack
                } else {
                    Settlement::Discard
                }
            }
            Observation::Foreign { repeat } => {
                if !params.focused && !repeat {
                    info!("Can't report turnaround time for unknown message: '{}'", id);
                }
                if params.exclusive {
                    Settlement::Ack
                } else {
                    if repeat {
                        tokio::time::sleep(FOREIGN_REQUEUE_PAUSE).await;
                    }
                    Settlement::Requeue
                }
            }
        };
        settle(delivery, settlement).await;
    }

    fn publish_report(&self) -> ReconciliationReport {
        let report = self.ledger.lock().report();
        self.feed.send_replace(report.clone());
        report
    }
}

enum Settlement {
    Ack,
    Requeue,
    Discard,
}

async fn settle(delivery: Delivery, settlement: Settlement) {
    let tag = delivery.delivery_tag;
    let result = match settlement {
        Settlement::Ack => delivery.ack().await,
        Settlement::Requeue => delivery.reject(true).await,
        Settlement::Discard => delivery.reject(false).await,
    };
    if let Err(e) = result {
        warn!("Failed to settle delivery {}: {}", tag, e);
    }
}
