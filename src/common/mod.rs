//! Common utilities and types shared across the application.

pub mod error;
pub mod messages;
pub mod shutdown;

// Re-export message types from messages module
pub use messages::{extract_correlation_id, Direction, Message};

pub use error::{AppError, ConfigError, GatewayError, SocketError, TesterError};
pub use shutdown::shutdown_signal;
