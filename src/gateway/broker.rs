//! Broker abstraction shared by the AMQP client and the in-memory broker.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::common::error::GatewayResult;
use crate::common::messages::{Direction, Message};

/// Message properties carried alongside a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// Per-message TTL in milliseconds (AMQP `expiration`).
    pub expiration_ms: Option<u64>,
    /// Publisher identity (AMQP `app_id`).
    pub app_id: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
}

/// Settles one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> GatewayResult<()>;
    async fn reject(&self, requeue: bool) -> GatewayResult<()>;
}

/// A message handed to a consumer. Must be settled exactly once.
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Bytes,
    pub properties: PublishProperties,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        payload: Bytes,
        properties: PublishProperties,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            payload,
            properties,
            redelivered,
            acker,
        }
    }

    /// Convert into a relayed message. A correlation id carried in the
    /// properties wins over one derived from the payload.
    pub fn to_message(&self, direction: Direction) -> Message {
        let message = Message::new(direction, self.payload.clone());
        match &self.properties.correlation_id {
            Some(id) => message.with_correlation_id(id.clone()),
            None => message,
        }
    }

    pub async fn ack(self) -> GatewayResult<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> GatewayResult<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("payload_len", &self.payload.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer. Capacity equals the prefetch count,
/// so an unread channel stops the broker from pushing more.
pub type Deliveries = mpsc::Receiver<Delivery>;

/// A message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> GatewayResult<()>;

    /// Start consuming `queue` under `consumer_tag`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> GatewayResult<Deliveries>;

    /// Publish to `queue` via the default exchange.
    async fn publish(
        &self,
        queue: &str,
        payload: Bytes,
        properties: PublishProperties,
    ) -> GatewayResult<()>;

    /// Stop a consumer. Deliveries already handed out stay settleable.
    async fn cancel(&self, consumer_tag: &str) -> GatewayResult<()>;

    async fn close(&self) -> GatewayResult<()>;
}
