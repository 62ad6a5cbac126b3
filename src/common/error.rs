//! Error types for the application.

use thiserror::Error;

/// Top-level application error.
///
/// Only startup-fatal and fatal-at-runtime conditions surface here; everything
/// else is absorbed and logged by the component that hit it.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("WebSocket error: {0}")]
    Socket(#[from] SocketError),

    #[error("Tester error: {0}")]
    Tester(#[from] TesterError),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {message}")]
    ParseError { message: String },

    #[error("Config validation failed: {message}")]
    ValidationError { message: String },

    #[error("Missing required setting: {section}.{key}")]
    MissingField { section: String, key: String },

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Remote config store error for '{key}': {message}")]
    Remote { key: String, message: String },
}

/// Broker (queue gateway) errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Unable to connect to MQ broker at {url}: {message}")]
    Unreachable { url: String, message: String },

    #[error("Failed to declare queue '{queue}': {message}")]
    Declare { queue: String, message: String },

    #[error("Failed to bind consumer '{tag}' to queue '{queue}': {message}")]
    Bind {
        queue: String,
        tag: String,
        message: String,
    },

    #[error("Queue '{queue}' has not been declared through this gateway")]
    UnknownQueue { queue: String },

    #[error("Failed to publish to queue '{queue}': {message}")]
    Publish { queue: String, message: String },

    #[error("Failed to settle delivery {delivery_tag}: {message}")]
    Settle { delivery_tag: u64, message: String },

    #[error("Invalid queue binding: {message}")]
    InvalidBinding { message: String },

    #[error("Broker connection closed")]
    Closed,

    #[error("Consumer on queue '{queue}' was closed by the broker")]
    ConsumerClosed { queue: String },
}

/// WebSocket endpoint errors.
#[derive(Debug, Error)]
pub enum SocketError {
    #[error("WebSocket handshake failed: {message}")]
    Handshake { message: String },

    #[error("WebSocket handshake failed before any successful connection: {message}")]
    InitialHandshake { message: String },

    #[error("Failed to build authentication token: {message}")]
    Auth { message: String },

    #[error("WebSocket send failed: {message}")]
    Send { message: String },

    #[error("WebSocket is not connected")]
    NotConnected,

    #[error("Timed out handing message to the WebSocket after {millis} ms")]
    HandOffTimeout { millis: u64 },

    #[error("Exceeded {failures} connection failures within {window_secs}s; giving up")]
    AttemptBudgetExhausted { failures: usize, window_secs: u64 },

    #[error("WebSocket handler is shutting down")]
    ShutDown,
}

/// Bridge tester errors.
#[derive(Debug, Error)]
pub enum TesterError {
    #[error("Broker error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Failed to write report '{path}': {source}")]
    Report {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias using AppError.
pub type Result<T> = std::result::Result<T, AppError>;

/// Result type alias for broker operations.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Result type alias for WebSocket operations.
pub type SocketResult<T> = std::result::Result<T, SocketError>;
