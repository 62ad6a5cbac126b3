//! MQ to WebSocket bridge.
//!
//! Relays messages from one broker queue to a WebSocket API and publishes the
//! API's replies to a second queue, plus a tester that measures round trips
//! through a running bridge.

pub mod bridge;
pub mod common;
pub mod config;
pub mod gateway;
pub mod socket;
pub mod telemetry;
pub mod tester;
