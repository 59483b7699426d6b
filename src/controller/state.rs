//! Connection state and the context that publishes it

use std::fmt;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::bridge::{LogLevel, SharedSink, TunnelEvent};

/// Tunnel connection state
///
/// ```text
///   Idle -> Connecting -> Connected -> Disconnected -> Idle
///              ^              |             |
///              |              v             v
///              +------- Reconnecting <------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No attempt in progress
    Idle,
    /// Building the chain and authenticating
    Connecting,
    /// Secure channel up, forwarding port published
    Connected,
    /// Waiting out the backoff before the next attempt
    Reconnecting,
    /// Attempt ended; carries a reason in the event
    Disconnected,
}

impl ConnectionState {
    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        }
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Connecting)
                | (Self::Connecting, Self::Connected | Self::Disconnected)
                | (Self::Connected, Self::Disconnected | Self::Reconnecting)
                | (Self::Reconnecting, Self::Connecting | Self::Disconnected)
                | (Self::Disconnected, Self::Idle | Self::Reconnecting)
        )
    }

    /// Whether an attempt is in progress
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit connection context owned by the controller
///
/// Holds the current state and forwarding port behind `watch` channels so
/// any number of readers can observe them, and fans events out to the
/// registered sinks. The controller worker is the only writer.
#[derive(Debug)]
pub struct StateContext {
    state: watch::Sender<ConnectionState>,
    port: watch::Sender<Option<u16>>,
    sinks: RwLock<Vec<SharedSink>>,
}

impl StateContext {
    /// Create a context in `Idle` with no forwarding port
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (port, _) = watch::channel(None);
        Self {
            state,
            port,
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Register a sink for all subsequent events
    pub fn add_sink(&self, sink: SharedSink) {
        self.sinks.write().push(sink);
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Published forwarding port, if the tunnel is ready
    #[must_use]
    pub fn forwarding_port(&self) -> Option<u16> {
        *self.port.borrow()
    }

    /// Watch the forwarding port
    #[must_use]
    pub fn subscribe_port(&self) -> watch::Receiver<Option<u16>> {
        self.port.subscribe()
    }

    /// Move to `next`, publishing a state event
    ///
    /// Illegal transitions are logged and ignored; returns whether the state
    /// changed.
    pub fn transition(&self, next: ConnectionState, reason: Option<String>) -> bool {
        let current = self.state();
        if !current.can_transition_to(next) {
            tracing::warn!(from = %current, to = %next, "Ignoring illegal state transition");
            return false;
        }

        self.state.send_replace(next);
        tracing::debug!(from = %current, to = %next, reason = ?reason, "State transition");
        self.emit(&TunnelEvent::State {
            state: next,
            reason,
        });
        true
    }

    /// Publish the forwarding port and a `Ready` event
    pub fn set_ready(&self, port: u16) {
        self.port.send_replace(Some(port));
        self.emit(&TunnelEvent::Ready { port });
    }

    /// Withdraw the forwarding port
    pub fn clear_port(&self) {
        self.port.send_replace(None);
    }

    /// Publish a log event
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(&TunnelEvent::Log {
            level,
            message: message.into(),
        });
    }

    fn emit(&self, event: &TunnelEvent) {
        for sink in self.sinks.read().iter() {
            sink.notify(event);
        }
    }
}

impl Default for StateContext {
    fn default() -> Self {
        Self::new()
    }
}
