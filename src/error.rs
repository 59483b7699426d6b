//! Error types for disguise-tunnel

use std::io;

use thiserror::Error;

use crate::packet::{IpProtocol, PacketError};
use crate::socks5::Socks5Error;
use crate::transport::TransportError;

/// Main error type for the tunnel core
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Malformed interface frame
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Flow session failure
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Disguise chain could not be established
    #[error("Handshake failed: {0}")]
    Handshake(#[from] TransportError),

    /// Secure channel failure
    #[error("Secure channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Virtual interface closed or broken
    #[error("Virtual interface error: {0}")]
    Interface(#[source] io::Error),

    /// An operation exceeded its bound
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// What timed out
        operation: String,
        /// Bound in milliseconds
        timeout_ms: u64,
    },
}

impl TunnelError {
    /// Check if this error is recoverable (can retry)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Packet(_) => false,
            Self::Session(_) => true,
            Self::Handshake(e) => e.is_recoverable(),
            Self::Channel(e) => e.is_recoverable(),
            Self::Interface(_) => false,
            Self::Timeout { .. } => true,
        }
    }

    /// Create an interface error
    pub fn interface(err: io::Error) -> Self {
        Self::Interface(err)
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Configuration validation failed
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error reading configuration
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Configuration errors are not recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Flow session errors
///
/// A session error tears down its own session and never propagates past the
/// flow table.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The dialer does not carry this protocol
    #[error("{0} flows are not supported by the proxy dialer")]
    Unsupported(IpProtocol),

    /// Local forwarding port not published yet
    #[error("Forwarding port not ready")]
    NotReady,

    /// Connecting to the local proxy failed
    #[error("Dial {target} failed: {reason}")]
    Dial {
        /// Proxy address
        target: String,
        /// Failure reason
        reason: String,
    },

    /// The local proxy rejected the CONNECT
    #[error("Proxy CONNECT to {destination} failed: {source}")]
    Proxy {
        /// Flow destination
        destination: String,
        /// Protocol error
        #[source]
        source: Socks5Error,
    },

    /// Reply frame could not be built
    #[error("Reply framing failed: {0}")]
    Reply(#[from] PacketError),

    /// Session I/O error
    #[error("Session I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Create a dial error
    pub fn dial(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Dial {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a proxy error
    pub fn proxy(destination: impl Into<String>, source: Socks5Error) -> Self {
        Self::Proxy {
            destination: destination.into(),
            source,
        }
    }
}

/// Secure channel errors raised by a [`SecureChannel`](crate::channel::SecureChannel)
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The outbound transport failed underneath the channel
    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    /// The server rejected the credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The session ended or was never established
    #[error("Session disconnected: {0}")]
    Disconnected(String),

    /// Dynamic forwarding could not be started
    #[error("Failed to forward local port {port}: {reason}")]
    Forwarding {
        /// Requested local port
        port: u16,
        /// Failure reason
        reason: String,
    },

    /// Opaque failure reported by the channel implementation
    #[error("{0}")]
    Library(String),
}

impl ChannelError {
    /// Check if this error is recoverable (can retry)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_recoverable(),
            Self::Authentication(_) => false,
            Self::Disconnected(_) => true,
            Self::Forwarding { .. } => false,
            Self::Library(_) => true,
        }
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a disconnected error
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Create a forwarding error
    pub fn forwarding(port: u16, reason: impl Into<String>) -> Self {
        Self::Forwarding {
            port,
            reason: reason.into(),
        }
    }

    /// Create a library error from its message text
    pub fn library(msg: impl Into<String>) -> Self {
        Self::Library(msg.into())
    }
}
