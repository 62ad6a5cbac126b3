//! Canonical message type relayed by the bridge.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Which way a message is travelling through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Consumed from the broker, bound for the WebSocket endpoint.
    ToSocket,
    /// Received from the WebSocket endpoint, bound for the broker.
    FromSocket,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToSocket => "to-socket",
            Self::FromSocket => "from-socket",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A relayed message.
///
/// The payload is opaque to the bridge. Fields are private so a message cannot
/// change once it has been handed to the router.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Bytes,
    direction: Direction,
    correlation_id: Option<String>,
    enqueued_at: DateTime<Utc>,
}

impl Message {
    /// Create a message, deriving its correlation id from the payload.
    pub fn new(direction: Direction, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let correlation_id = extract_correlation_id(&payload);
        Self {
            payload,
            direction,
            correlation_id,
            enqueued_at: Utc::now(),
        }
    }

    /// Override the correlation id (e.g. from broker message properties).
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Derive an application-level correlation id from a payload.
///
/// A JSON object with a string `id` field yields that field; any other UTF-8
/// payload yields its trimmed text. Binary or blank payloads have no id.
pub fn extract_correlation_id(payload: &[u8]) -> Option<String> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(payload) {
        if let Some(serde_json::Value::String(id)) = map.get("id") {
            return Some(id.clone());
        }
    }

    std::str::from_utf8(payload)
        .ok()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
