//! Bridge channel management.
//!
//! Groups the channels between the socket client, the router and the
//! lifecycle driver. All data channels are bounded so a slow side pushes back
//! on the other instead of buffering without limit.

use tokio::sync::{mpsc, watch};

use crate::common::messages::Message;
use crate::socket::client::SocketRequest;

/// Channels for the socket client.
pub struct SocketChannels {
    /// Receiver for queue -> socket hand-offs.
    pub to_socket_rx: mpsc::Receiver<SocketRequest>,
    /// Sender for socket -> queue messages.
    pub from_socket_tx: mpsc::Sender<Message>,
    /// Receiver for the shutdown signal.
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Channels for the router side.
pub struct RouterChannels {
    /// Sender for queue -> socket hand-offs.
    pub to_socket_tx: mpsc::Sender<SocketRequest>,
    /// Receiver for socket -> queue messages.
    pub from_socket_rx: mpsc::Receiver<Message>,
}

/// Control channels for shutdown coordination.
pub struct ControlChannels {
    /// Sender to trigger shutdown.
    pub shutdown_tx: watch::Sender<bool>,
}

/// Bundle of all channels created by the bridge.
pub struct ChannelBundle {
    pub socket: SocketChannels,
    pub router: RouterChannels,
    pub control: ControlChannels,
}

impl ChannelBundle {
    /// Create a new set of bridge channels with `capacity` slots per direction.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (to_socket_tx, to_socket_rx) = mpsc::channel(capacity);
        let (from_socket_tx, from_socket_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            socket: SocketChannels {
                to_socket_rx,
                from_socket_tx,
                shutdown_rx,
            },
            router: RouterChannels {
                to_socket_tx,
                from_socket_rx,
            },
            control: ControlChannels { shutdown_tx },
        }
    }
}
