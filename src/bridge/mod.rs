//! Bridge between the message queues and the WebSocket API.
//!
//! ## Module Structure
//!
//! - `channels`: Channels between the socket client, router and lifecycle driver
//! - `router`: Inbound and outbound message routing (`MessageRouter`)
//! - `runtime`: Startup, run and ordered shutdown (`Bridge`)

pub mod channels;
pub mod router;
pub mod runtime;

pub use channels::{ChannelBundle, ControlChannels, RouterChannels, SocketChannels};
pub use router::{MessageRouter, RouterConfig, RouterHandle, RouterMode, SocketLink};
pub use runtime::Bridge;
