//! Queue binding: a queue name plus the delivery semantics applied to it.

use crate::common::error::{GatewayError, GatewayResult};

/// A queue the gateway owns.
///
/// Fixed at startup. The TTL is only set on the outbound-from-socket binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    name: String,
    ttl_ms: Option<u64>,
    consumer_tag: String,
}

impl QueueBinding {
    pub fn new(name: impl Into<String>, consumer_tag: impl Into<String>) -> GatewayResult<Self> {
        let name = name.into();
        let consumer_tag = consumer_tag.into();

        if name.trim().is_empty() {
            return Err(GatewayError::InvalidBinding {
                message: "queue name must not be empty".to_string(),
            });
        }
        if consumer_tag.trim().is_empty() {
            return Err(GatewayError::InvalidBinding {
                message: format!("consumer tag for queue '{}' must not be empty", name),
            });
        }

        Ok(Self {
            name,
            ttl_ms: None,
            consumer_tag,
        })
    }

    /// Stamp every message published to this queue with a TTL.
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl_ms(&self) -> Option<u64> {
        self.ttl_ms
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_requires_name_and_tag() {
        assert!(QueueBinding::new("", "tag").is_err());
        assert!(QueueBinding::new("to_ws", "  ").is_err());

        let binding = QueueBinding::new("from_ws", "mqhandler").unwrap().with_ttl(60_000);
        assert_eq!(binding.name(), "from_ws");
        assert_eq!(binding.consumer_tag(), "mqhandler");
        assert_eq!(binding.ttl_ms(), Some(60_000));
    }

    #[test]
    fn test_inbound_binding_has_no_ttl() {
        let binding = QueueBinding::new("to_ws", "mqhandler").unwrap();
        assert_eq!(binding.ttl_ms(), None);
    }
}
