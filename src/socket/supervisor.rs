//! WebSocket connection lifecycle and the reconnect-or-give-up decision.
//!
//! The supervisor owns the connection state and the failure window. The
//! socket client reports events into it; the router only observes the state
//! through a watch channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::common::error::{SocketError, SocketResult};
use crate::socket::window::AttemptWindow;
use crate::telemetry::BridgeMetrics;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
    /// Terminal.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Backoff => "BACKOFF",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    KeepaliveTimeout,
    SocketError(String),
    RemoteClose(Option<String>),
    HandshakeFailed(String),
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepaliveTimeout => write!(f, "keepalive timeout"),
            Self::SocketError(e) => write!(f, "socket error: {}", e),
            Self::RemoteClose(Some(reason)) => write!(f, "closed by remote: {}", reason),
            Self::RemoteClose(None) => write!(f, "closed by remote"),
            Self::HandshakeFailed(e) => write!(f, "handshake failed: {}", e),
        }
    }
}

/// Generation number of one connection attempt.
pub type ConnectionId = u64;

/// Outcome of a disconnect report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Within budget; connect again.
    Reconnect { failures: usize },
    /// Budget exhausted; the supervisor is now `Failed`.
    Fatal { failures: usize },
    /// The attempt was already reported; nothing changed.
    Ignored,
}

struct Inner {
    state: ConnectionState,
    window: AttemptWindow,
    generation: ConnectionId,
    /// Attempt whose end has not been reported yet.
    live: Option<ConnectionId>,
    ever_connected: bool,
}

/// Owns one socket endpoint's lifecycle.
pub struct ConnectionSupervisor {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    max_attempts: usize,
    metrics: Arc<BridgeMetrics>,
}

impl ConnectionSupervisor {
    pub fn new(max_attempts: usize, window: Duration, metrics: Arc<BridgeMetrics>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                window: AttemptWindow::new(window),
                generation: 0,
                live: None,
                ever_connected: false,
            }),
            state_tx,
            max_attempts,
            metrics,
        }
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            debug!("WebSocket state {} -> {}", inner.state, state);
            inner.state = state;
            self.state_tx.send_replace(state);
        }
    }

    /// Begin a connection attempt.
    pub fn connect(&self) -> SocketResult<ConnectionId> {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Failed {
            return Err(SocketError::AttemptBudgetExhausted {
                failures: inner.window.len(),
                window_secs: inner.window.window().as_secs(),
            });
        }

        inner.generation += 1;
        let id = inner.generation;
        inner.live = Some(id);
        self.set_state(&mut inner, ConnectionState::Connecting);
        self.metrics.record_ws_attempt();
        info!("Connecting to WebSocket (attempt #{})", id);
        Ok(id)
    }

    /// The handshake for attempt `id` succeeded.
    pub fn on_connected(&self, id: ConnectionId) {
        let mut inner = self.inner.lock();
        if inner.live != Some(id) || inner.state != ConnectionState::Connecting {
            debug!("Ignoring stale connect report for attempt #{}", id);
            return;
        }
        inner.ever_connected = true;
        self.set_state(&mut inner, ConnectionState::Connected);
        info!("WebSocket connected");
    }

    /// Attempt `id` ended.
    pub fn on_disconnected(&self, id: ConnectionId, cause: DisconnectCause) -> Verdict {
        self.on_disconnected_at(id, cause, Instant::now())
    }

    /// [`on_disconnected`](Self::on_disconnected) with an explicit clock.
    pub fn on_disconnected_at(
        &self,
        id: ConnectionId,
        cause: DisconnectCause,
        now: Instant,
    ) -> Verdict {
        let mut inner = self.inner.lock();
        if inner.live != Some(id) {
            debug!("Ignoring repeated disconnect report for attempt #{}", id);
            return Verdict::Ignored;
        }
        inner.live = None;

        let failures = inner.window.record(now);
        let window_secs = inner.window.window().as_secs();

        if failures >= self.max_attempts {
            self.set_state(&mut inner, ConnectionState::Failed);
            error!(
                "WebSocket {}; {} failures within {}s reached the limit of {}; giving up",
                cause, failures, window_secs, self.max_attempts
            );
            Verdict::Fatal { failures }
        } else {
            self.set_state(&mut inner, ConnectionState::Backoff);
            warn!(
                "WebSocket {}; {} of {} failures within {}s, reconnecting",
                cause, failures, self.max_attempts, window_secs
            );
            Verdict::Reconnect { failures }
        }
    }

    /// Move straight to `Failed`, for errors that must not be retried.
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.live = None;
        self.set_state(&mut inner, ConnectionState::Failed);
    }

    /// Orderly stop. Later reports for the live attempt are ignored.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.live = None;
        if inner.state != ConnectionState::Failed {
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Whether any attempt has ever completed its handshake.
    pub fn has_connected(&self) -> bool {
        self.inner.lock().ever_connected
    }

    pub fn failures_in_window(&self) -> usize {
        self.inner.lock().window.len()
    }

    pub fn window_secs(&self) -> u64 {
        self.inner.lock().window.window().as_secs()
    }

    /// Read-only view of the state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}
