//! In-process broker.
//!
//! Follows AMQP default-exchange semantics closely enough to run the bridge
//! and the tester without a server: durable declare, per-consumer prefetch,
//! ack/reject with requeue to the head of the queue, per-message expiry and
//! unroutable publishes dropped silently.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::common::error::{GatewayError, GatewayResult};
use crate::gateway::broker::{Acknowledger, Broker, Deliveries, Delivery, PublishProperties};

/// A message as recorded by [`MemoryBroker::published`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub payload: Bytes,
    pub properties: PublishProperties,
}

#[derive(Debug, Clone)]
struct Stored {
    payload: Bytes,
    properties: PublishProperties,
    published_at: Instant,
    redelivered: bool,
}

impl Stored {
    fn is_expired(&self, now: Instant) -> bool {
        self.properties
            .expiration_ms
            .is_some_and(|ttl| now.duration_since(self.published_at) >= Duration::from_millis(ttl))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    /// delivery tag -> (consumer tag, message)
    unacked: BTreeMap<u64, (String, Stored)>,
    published: Vec<PublishedMessage>,
    acked: usize,
    rejected: usize,
    requeued: usize,
    expired: usize,
}

impl QueueState {
    fn unacked_for(&self, consumer_tag: &str) -> usize {
        self.unacked
            .values()
            .filter(|(tag, _)| tag == consumer_tag)
            .count()
    }

    fn requeue_consumer(&mut self, consumer_tag: &str) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (tag, _))| tag == consumer_tag)
            .map(|(delivery_tag, _)| *delivery_tag)
            .collect();
        // Reverse so the oldest delivery ends up at the head.
        for delivery_tag in tags.into_iter().rev() {
            if let Some((_, mut stored)) = self.unacked.remove(&delivery_tag) {
                stored.redelivered = true;
                self.ready.push_front(stored);
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, QueueState>,
    /// consumer tag -> queue
    consumers: HashMap<String, String>,
    next_delivery_tag: u64,
    failing_publishes: usize,
    closed: bool,
}

impl State {
    fn take_next(&mut self, queue: &str, consumer_tag: &str, prefetch: usize) -> Option<(u64, Stored)> {
        let q = self.queues.get_mut(queue)?;
        if q.unacked_for(consumer_tag) >= prefetch {
            return None;
        }

        let now = Instant::now();
        while q.ready.front().is_some_and(|m| m.is_expired(now)) {
            q.ready.pop_front();
            q.expired += 1;
        }

        let stored = q.ready.pop_front()?;
        self.next_delivery_tag += 1;
        let delivery_tag = self.next_delivery_tag;
        q.unacked
            .insert(delivery_tag, (consumer_tag.to_string(), stored.clone()));
        Some((delivery_tag, stored))
    }
}

struct Shared {
    state: Mutex<State>,
    version: watch::Sender<u64>,
}

impl Shared {
    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Cheaply cloneable handle to one in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                version,
            }),
        }
    }

    /// Enqueue a message as an external producer would.
    pub fn push(&self, queue: &str, payload: impl Into<Bytes>) {
        self.enqueue(queue, payload.into(), PublishProperties::default());
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.state.lock().failing_publishes = count;
    }

    /// Every message routed to `queue`, in publish order.
    pub fn published(&self, queue: &str) -> Vec<PublishedMessage> {
        self.with_queue(queue, |q| q.published.clone())
            .unwrap_or_default()
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len()).unwrap_or(0)
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len()).unwrap_or(0)
    }

    pub fn acked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.acked).unwrap_or(0)
    }

    /// Rejections without requeue.
    pub fn rejected_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.rejected).unwrap_or(0)
    }

    pub fn requeued_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.requeued).unwrap_or(0)
    }

    pub fn expired_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.expired).unwrap_or(0)
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .consumers
            .values()
            .filter(|q| *q == queue)
            .count()
    }

    fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> Option<T> {
        self.shared.state.lock().queues.get(queue).map(f)
    }

    fn enqueue(&self, queue: &str, payload: Bytes, properties: PublishProperties) -> bool {
        let routed = {
            let mut state = self.shared.state.lock();
            match state.queues.get_mut(queue) {
                Some(q) => {
                    q.published.push(PublishedMessage {
                        payload: payload.clone(),
                        properties: properties.clone(),
                    });
                    q.ready.push_back(Stored {
                        payload,
                        properties,
                        published_at: Instant::now(),
                        redelivered: false,
                    });
                    true
                }
                None => false,
            }
        };

        if routed {
            self.shared.notify();
        } else {
            debug!("Dropping unroutable message for undeclared queue '{}'", queue);
        }
        routed
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> GatewayResult<()> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(GatewayError::Closed);
        }
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> GatewayResult<Deliveries> {
        let bind_error = |message: &str| GatewayError::Bind {
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
            message: message.to_string(),
        };

        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(GatewayError::Closed);
            }
            if !state.queues.contains_key(queue) {
                return Err(bind_error("no such queue"));
            }
            if state.consumers.contains_key(consumer_tag) {
                return Err(bind_error("consumer tag already in use"));
            }
            state
                .consumers
                .insert(consumer_tag.to_string(), queue.to_string());
        }

        let prefetch = usize::from(prefetch.max(1));
        let (tx, rx) = mpsc::channel(prefetch);
        tokio::spawn(pump(
            self.shared.clone(),
            queue.to_string(),
            consumer_tag.to_string(),
            prefetch,
            tx,
        ));
        Ok(rx)
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Bytes,
        properties: PublishProperties,
    ) -> GatewayResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(GatewayError::Closed);
            }
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(GatewayError::Publish {
                    queue: queue.to_string(),
                    message: "injected failure".to_string(),
                });
            }
        }

        self.enqueue(queue, payload, properties);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> GatewayResult<()> {
        let removed = self.shared.state.lock().consumers.remove(consumer_tag);
        if removed.is_some() {
            self.shared.notify();
        }
        Ok(())
    }

    async fn close(&self) -> GatewayResult<()> {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.consumers.clear();
            for q in state.queues.values_mut() {
                let tags: Vec<String> = q.unacked.values().map(|(t, _)| t.clone()).collect();
                for tag in tags {
                    q.requeue_consumer(&tag);
                }
            }
        }
        self.shared.notify();
        Ok(())
    }
}

async fn pump(
    shared: Arc<Shared>,
    queue: String,
    consumer_tag: String,
    prefetch: usize,
    tx: mpsc::Sender<Delivery>,
) {
    let mut version_rx = shared.version.subscribe();

    loop {
        version_rx.borrow_and_update();

        let next = {
            let mut state = shared.state.lock();
            if state.closed || state.consumers.get(&consumer_tag) != Some(&queue) {
                break;
            }
            state.take_next(&queue, &consumer_tag, prefetch)
        };

        match next {
            Some((delivery_tag, stored)) => {
                let delivery = Delivery::new(
                    delivery_tag,
                    stored.payload,
                    stored.properties,
                    stored.redelivered,
                    Box::new(MemoryAcker {
                        shared: shared.clone(),
                        queue: queue.clone(),
                        delivery_tag,
                    }),
                );
                if tx.send(delivery).await.is_err() {
                    release_consumer(&shared, &queue, &consumer_tag);
                    break;
                }
            }
            None => {
                tokio::select! {
                    changed = version_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => {
                        release_consumer(&shared, &queue, &consumer_tag);
                        break;
                    }
                }
            }
        }
    }

    debug!("Consumer '{}' on '{}' stopped", consumer_tag, queue);
}

/// Forget a consumer whose receiver went away and requeue what it held.
fn release_consumer(shared: &Shared, queue: &str, consumer_tag: &str) {
    {
        let mut state = shared.state.lock();
        if state.consumers.get(consumer_tag).map(String::as_str) == Some(queue) {
            state.consumers.remove(consumer_tag);
        }
        if let Some(q) = state.queues.get_mut(queue) {
            q.requeue_consumer(consumer_tag);
        }
    }
    shared.notify();
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, f: impl FnOnce(&mut QueueState, Stored)) -> GatewayResult<()> {
        {
            let mut state = self.shared.state.lock();
            let q = state.queues.get_mut(&self.queue).ok_or(GatewayError::UnknownQueue {
                queue: self.queue.clone(),
            })?;
            let (_, stored) = q.unacked.remove(&self.delivery_tag).ok_or_else(|| {
                GatewayError::Settle {
                    delivery_tag: self.delivery_tag,
                    message: "unknown delivery tag".to_string(),
                }
            })?;
            f(q, stored);
        }
        self.shared.notify();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> GatewayResult<()> {
        self.settle(|q, _| q.acked += 1)
    }

    async fn reject(&self, requeue: bool) -> GatewayResult<()> {
        self.settle(|q, mut stored| {
            if requeue {
                stored.redelivered = true;
                q.ready.push_front(stored);
                q.requeued += 1;
            } else {
                q.rejected += 1;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn declared(queue: &str) -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_queue(queue).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let broker = declared("q").await;
        broker.push("q", "one");
        broker.push("q", "two");

        let mut rx = broker.consume("q", "c1", 10).await.unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload, Bytes::from("one"));
        assert_eq!(second.payload, Bytes::from("two"));
        assert!(!first.redelivered);

        first.ack().await.unwrap();
        second.ack().await.unwrap();
        assert_eq!(broker.acked_count("q"), 2);
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers_at_head() {
        let broker = declared("q").await;
        broker.push("q", "a");
        broker.push("q", "b");

        let mut rx = broker.consume("q", "c1", 1).await.unwrap();
        let a = rx.recv().await.unwrap();
        a.reject(true).await.unwrap();

        let again = rx.recv().await.unwrap();
        assert_eq!(again.payload, Bytes::from("a"));
        assert!(again.redelivered);
        assert_eq!(broker.requeued_count("q"), 1);
        again.ack().await.unwrap();

        let b = rx.recv().await.unwrap();
        assert_eq!(b.payload, Bytes::from("b"));
        b.reject(false).await.unwrap();
        assert_eq!(broker.rejected_count("q"), 1);
        assert_eq!(broker.ready_count("q"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_unacked() {
        let broker = declared("q").await;
        for i in 0..3 {
            broker.push("q", format!("m{}", i));
        }

        let mut rx = broker.consume("q", "c1", 1).await.unwrap();
        let first = rx.recv().await.unwrap();
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.ready_count("q"), 2);

        first.ack().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.payload, Bytes::from("m1"));
    }

    #[tokio::test]
    async fn test_duplicate_consumer_tag_fails_to_bind() {
        let broker = declared("q").await;
        let _rx = broker.consume("q", "tag", 1).await.unwrap();

        let err = broker.consume("q", "tag", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Bind { .. }));
        assert!(err.to_string().contains("already in use"));
    }

    #[tokio::test]
    async fn test_consume_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        let err = broker.consume("missing", "tag", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_unroutable_publish_is_dropped() {
        let broker = MemoryBroker::new();
        broker
            .publish("nowhere", Bytes::from("x"), PublishProperties::default())
            .await
            .unwrap();
        assert!(!broker.is_declared("nowhere"));
        assert!(broker.published("nowhere").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_are_not_delivered() {
        let broker = declared("q").await;
        let short = PublishProperties {
            expiration_ms: Some(1_000),
            ..PublishProperties::default()
        };
        broker.publish("q", Bytes::from("stale"), short).await.unwrap();
        broker
            .publish("q", Bytes::from("fresh"), PublishProperties::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut rx = broker.consume("q", "c1", 5).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.payload, Bytes::from("fresh"));
        assert_eq!(broker.expired_count("q"), 1);
    }

    #[tokio::test]
    async fn test_cancel_ends_stream_but_keeps_deliveries_settleable() {
        let broker = declared("q").await;
        broker.push("q", "held");

        let mut rx = broker.consume("q", "c1", 5).await.unwrap();
        let held = rx.recv().await.unwrap();

        broker.cancel("c1").await.unwrap();
        assert!(rx.recv().await.is_none());
        assert_eq!(broker.consumer_count("q"), 0);

        held.ack().await.unwrap();
        assert_eq!(broker.acked_count("q"), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_requeues_unacked() {
        let broker = declared("q").await;
        broker.push("q", "m");

        let mut rx = broker.consume("q", "c1", 5).await.unwrap();
        let delivery = rx.recv().await.unwrap();
        drop(delivery);
        drop(rx);

        for _ in 0..10 {
            if broker.ready_count("q") == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.ready_count("q"), 1);
        assert_eq!(broker.consumer_count("q"), 0);
    }

    #[tokio::test]
    async fn test_injected_publish_failures() {
        let broker = declared("q").await;
        broker.fail_next_publishes(2);

        for _ in 0..2 {
            let err = broker
                .publish("q", Bytes::from("x"), PublishProperties::default())
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Publish { .. }));
        }
        broker
            .publish("q", Bytes::from("x"), PublishProperties::default())
            .await
            .unwrap();
        assert_eq!(broker.published("q").len(), 1);
    }

    #[tokio::test]
    async fn test_closed_broker_refuses_work() {
        let broker = declared("q").await;
        broker.close().await.unwrap();

        assert!(matches!(
            broker.declare_queue("q").await,
            Err(GatewayError::Closed)
        ));
        assert!(matches!(
            broker
                .publish("q", Bytes::from("x"), PublishProperties::default())
                .await,
            Err(GatewayError::Closed)
        ));
    }
}
