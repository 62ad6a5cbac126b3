//! Queue gateway: owns the bridge's queues and applies their delivery
//! semantics on top of a [`Broker`].

pub mod amqp;
pub mod binding;
pub mod broker;
pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::common::error::{GatewayError, GatewayResult};
use crate::common::messages::Message;

pub use amqp::AmqpBroker;
pub use binding::QueueBinding;
pub use broker::{Acknowledger, Broker, Deliveries, Delivery, PublishProperties};
pub use memory::{MemoryBroker, PublishedMessage};

/// Queue access for the router and the tester.
///
/// Every queue must go through [`QueueGateway::ensure_queue`] first; the
/// binding registered there decides the consumer tag and TTL used later.
pub struct QueueGateway {
    broker: Arc<dyn Broker>,
    bindings: RwLock<HashMap<String, QueueBinding>>,
}

impl QueueGateway {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Declare the binding's queue (durable, idempotent) and remember it.
    pub async fn ensure_queue(&self, binding: &QueueBinding) -> GatewayResult<()> {
        self.broker.declare_queue(binding.name()).await?;
        self.bindings
            .write()
            .insert(binding.name().to_string(), binding.clone());
        info!(
            queue = binding.name(),
            consumer_tag = binding.consumer_tag(),
            ttl_ms = binding.ttl_ms(),
            "Queue ready"
        );
        Ok(())
    }

    fn binding(&self, queue: &str) -> GatewayResult<QueueBinding> {
        self.bindings
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownQueue {
                queue: queue.to_string(),
            })
    }

    /// Start consuming under the binding's consumer tag.
    ///
    /// A bind failure is returned as-is; callers treat it as fatal rather than
    /// retrying.
    pub async fn consume(&self, queue: &str, prefetch: u16) -> GatewayResult<Deliveries> {
        let binding = self.binding(queue)?;
        self.broker
            .consume(binding.name(), binding.consumer_tag(), prefetch)
            .await
    }

    /// Publish a message, stamped with the binding's TTL and consumer tag.
    pub async fn publish(&self, queue: &str, message: &Message) -> GatewayResult<()> {
        let binding = self.binding(queue)?;
        let content_type = match message.payload_text() {
            Some(_) => "text/plain",
            None => "application/octet-stream",
        };
        let properties = PublishProperties {
            expiration_ms: binding.ttl_ms(),
            app_id: Some(binding.consumer_tag().to_string()),
            correlation_id: message.correlation_id().map(str::to_string),
            content_type: Some(content_type.to_string()),
        };

        self.broker
            .publish(binding.name(), message.payload().clone(), properties)
            .await?;
        debug!(
            queue,
            correlation_id = message.correlation_id(),
            "Published message"
        );
        Ok(())
    }

    /// Cancel the binding's consumer.
    pub async fn cancel(&self, queue: &str) -> GatewayResult<()> {
        let binding = self.binding(queue)?;
        self.broker.cancel(binding.consumer_tag()).await
    }

    pub async fn close(&self) -> GatewayResult<()> {
        self.broker.close().await
    }
}
