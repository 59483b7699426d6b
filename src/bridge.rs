//! State/notification bridge to the UI collaborator
//!
//! The controller and the flow table publish [`TunnelEvent`]s through a
//! [`StateContext`](crate::controller::StateContext), which fans each event
//! out to every registered [`NotificationSink`].

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::controller::ConnectionState;

/// Severity of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Informational
    Info,
    /// Recoverable problem
    Warn,
    /// Failure surfaced to the user
    Error,
}

/// Event delivered to the UI collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TunnelEvent {
    /// Connection state changed
    State {
        /// New state
        state: ConnectionState,
        /// Why the transition happened, when known
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Local dynamic forwarding is accepting connections
    Ready {
        /// Loopback port of the SOCKS proxy
        port: u16,
    },
    /// Message worth surfacing
    Log {
        /// Severity
        level: LogLevel,
        /// Human-readable text
        message: String,
    },
}

impl TunnelEvent {
    /// Serialize as one JSON object
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Receiver of tunnel events
///
/// Called synchronously from the publishing task, so implementations must
/// not block.
pub trait NotificationSink: Send + Sync + fmt::Debug {
    /// Deliver one event
    fn notify(&self, event: &TunnelEvent);
}

/// Shared sink handle
pub type SharedSink = Arc<dyn NotificationSink>;

/// Sink forwarding events into a `tokio::sync::broadcast` channel
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<TunnelEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` undelivered events
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, event: &TunnelEvent) {
        // No receivers is not an error
        let _ = self.tx.send(event.clone());
    }
}

/// Sink writing events to the `tracing` subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, event: &TunnelEvent) {
        match event {
            TunnelEvent::State {
                state,
                reason: Some(reason),
            } => tracing::info!(state = %state, reason = %reason, "Tunnel state changed"),
            TunnelEvent::State { state, reason: None } => {
                tracing::info!(state = %state, "Tunnel state changed");
            }
            TunnelEvent::Ready { port } => tracing::info!(port, "Tunnel ready"),
            TunnelEvent::Log {
                level: LogLevel::Info,
                message,
            } => tracing::info!("{message}"),
            TunnelEvent::Log {
                level: LogLevel::Warn,
                message,
            } => tracing::warn!("{message}"),
            TunnelEvent::Log {
                level: LogLevel::Error,
                message,
            } => tracing::error!("{message}"),
        }
    }
}
