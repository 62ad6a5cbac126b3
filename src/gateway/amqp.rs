//! AMQP 0-9-1 broker client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::common::error::{GatewayError, GatewayResult};
use crate::config::BrokerSettings;
use crate::gateway::broker::{Acknowledger, Broker, Deliveries, Delivery, PublishProperties};
use crate::telemetry::BridgeMetrics;

/// Connection retries before the broker is declared unreachable.
const CONNECT_RETRIES: usize = 5;

fn connect_backoff() -> impl Iterator<Item = Duration> {
    backon::ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(2))
        .with_max_delay(Duration::from_secs(30))
        .with_max_times(CONNECT_RETRIES)
        .build()
}

/// Broker backed by a lapin connection.
///
/// Publishing shares one channel; each consumer gets its own channel so its
/// prefetch limit applies to it alone.
pub struct AmqpBroker {
    connection: Connection,
    publish_channel: Channel,
    consumers: Mutex<HashMap<String, Channel>>,
}

impl AmqpBroker {
    /// Connect, retrying with exponential backoff.
    pub async fn connect(
        settings: &BrokerSettings,
        metrics: Arc<BridgeMetrics>,
    ) -> GatewayResult<Self> {
        let url = settings.url();
        let display_url = settings.redacted_url();
        let mut backoff = connect_backoff();

        let connection = loop {
            metrics.record_mq_attempt();
            info!("Creating MQ connection to {}", display_url);

            match Connection::connect(&url, ConnectionProperties::default()).await {
                Ok(connection) => break connection,
                Err(e) => match backoff.next() {
                    Some(delay) => {
                        warn!(
                            "MQ connection failed: {}; retrying in {:.1} seconds",
                            e,
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return Err(GatewayError::Unreachable {
                            url: display_url,
                            message: e.to_string(),
                        });
                    }
                },
            }
        };

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| GatewayError::Unreachable {
                url: display_url.clone(),
                message: format!("unable to open channel: {}", e),
            })?;

        info!("Connected to MQ broker at {}", display_url);
        Ok(Self {
            connection,
            publish_channel,
            consumers: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_queue(&self, queue: &str) -> GatewayResult<()> {
        self.publish_channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| GatewayError::Declare {
                queue: queue.to_string(),
                message: e.to_string(),
            })?;
        debug!("Declared queue '{}'", queue);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> GatewayResult<Deliveries> {
        let bind_error = |e: lapin::Error| GatewayError::Bind {
            queue: queue.to_string(),
            tag: consumer_tag.to_string(),
            message: e.to_string(),
        };

        let channel = self.connection.create_channel().await.map_err(bind_error)?;
        channel
            .basic_qos(prefetch.max(1), BasicQosOptions::default())
            .await
            .map_err(bind_error)?;
        let mut consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(bind_error)?;

        self.consumers
            .lock()
            .insert(consumer_tag.to_string(), channel);

        let (tx, rx) = mpsc::channel(usize::from(prefetch.max(1)));
        let tag = consumer_tag.to_string();
        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!("Consumer '{}' stream error: {}", tag, e);
                        break;
                    }
                };
                if tx.send(convert_delivery(delivery)).await.is_err() {
                    break;
                }
            }
            debug!("Consumer '{}' stream ended", tag);
        });

        info!("Consuming '{}' as '{}'", queue, consumer_tag);
        Ok(rx)
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Bytes,
        properties: PublishProperties,
    ) -> GatewayResult<()> {
        let publish_error = |e: lapin::Error| GatewayError::Publish {
            queue: queue.to_string(),
            message: e.to_string(),
        };

        self.publish_channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                to_basic_properties(&properties),
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> GatewayResult<()> {
        let channel = self.consumers.lock().remove(consumer_tag);
        if let Some(channel) = channel {
            if let Err(e) = channel
                .basic_cancel(consumer_tag, BasicCancelOptions::default())
                .await
            {
                warn!("Failed to cancel consumer '{}': {}", consumer_tag, e);
            }
        }
        Ok(())
    }

    async fn close(&self) -> GatewayResult<()> {
        self.connection
            .close(200, "OK")
            .await
            .map_err(|_| GatewayError::Closed)
    }
}

fn to_basic_properties(properties: &PublishProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(ttl) = properties.expiration_ms {
        basic = basic.with_expiration(ShortString::from(ttl.to_string()));
    }
    if let Some(app_id) = &properties.app_id {
        basic = basic.with_app_id(ShortString::from(app_id.clone()));
    }
    if let Some(id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> PublishProperties {
    PublishProperties {
        expiration_ms: basic
            .expiration()
            .as_ref()
            .and_then(|s| s.as_str().parse().ok()),
        app_id: basic.app_id().as_ref().map(|s| s.to_string()),
        correlation_id: basic.correlation_id().as_ref().map(|s| s.to_string()),
        content_type: basic.content_type().as_ref().map(|s| s.to_string()),
    }
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery::new(
        delivery.delivery_tag,
        Bytes::from(delivery.data),
        from_basic_properties(&delivery.properties),
        delivery.redelivered,
        Box::new(AmqpAcker {
            acker: delivery.acker,
            delivery_tag: delivery.delivery_tag,
        }),
    )
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
    delivery_tag: u64,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> GatewayResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| GatewayError::Settle {
                delivery_tag: self.delivery_tag,
                message: e.to_string(),
            })
    }

    async fn reject(&self, requeue: bool) -> GatewayResult<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| GatewayError::Settle {
                delivery_tag: self.delivery_tag,
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_round_trip_through_amqp() {
        let properties = PublishProperties {
            expiration_ms: Some(300_000),
            app_id: Some("mqhandler".to_string()),
            correlation_id: Some("m1".to_string()),
            content_type: Some("text/plain".to_string()),
        };

        let basic = to_basic_properties(&properties);
        assert_eq!(
            basic.expiration().as_ref().map(|s| s.as_str()),
            Some("300000")
        );
        assert_eq!(from_basic_properties(&basic), properties);
    }

    #[test]
    fn test_connect_backoff_is_bounded() {
        let delays: Vec<Duration> = connect_backoff().collect();
        assert_eq!(delays.len(), CONNECT_RETRIES);
        assert_eq!(delays[0], Duration::from_secs(2));
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(30)));
    }
}
