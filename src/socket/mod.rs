//! WebSocket endpoint: authentication, connection lifecycle and the client
//! task that relays frames.

pub mod auth;
pub mod client;
pub mod supervisor;
pub mod window;

pub use auth::{connect_url, Credentials};
pub use client::{send_keepalive, Connector, SocketClient, SocketRequest, WsConnector};
pub use supervisor::{ConnectionId, ConnectionState, ConnectionSupervisor, DisconnectCause, Verdict};
pub use window::AttemptWindow;
