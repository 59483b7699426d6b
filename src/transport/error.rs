//! Errors raised while building or connecting a disguise chain
//!
//! Variants are grouped by the layer that raises them: the outer TCP dial,
//! the TLS front, payload injection, the WebSocket upgrade and the upstream
//! SOCKS5 hop. Configuration problems that no retry can fix are kept apart
//! from network failures through [`TransportError::is_recoverable`].

use std::io;

use thiserror::Error;

use crate::socks5::Socks5Error;

/// Failure of one disguise chain connect
#[derive(Debug, Error)]
pub enum TransportError {
    // Outer dial
    #[error("dial {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection refused by {address}")]
    ConnectionRefused { address: String },

    /// Dial or handshake exceeded the connect timeout
    #[error("{address}: no answer within {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },

    #[error("Failed to resolve {address}: {reason}")]
    DnsResolutionFailed { address: String, reason: String },

    /// Setting `option` on the dialed socket failed
    #[error("socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    // TLS front
    #[error("TLS client setup: {0}")]
    TlsConfigError(String),

    /// `server_name` is the SNI sent, which may differ from the dialed host
    #[error("TLS handshake (sni {server_name}) failed: {reason}")]
    TlsHandshakeFailed { server_name: String, reason: String },

    #[error("{0:?} is not usable as a TLS server name")]
    InvalidServerName(String),

    // Payload injection
    /// Proxy answered the injected payload with something other than 200
    #[error("Proxy rejected the payload: {response}")]
    HandshakeRejected { response: String },

    // WebSocket upgrade
    #[error("WebSocket upgrade failed: {0}")]
    WebSocketHandshakeFailed(String),

    /// Payload did not yield a usable upgrade request
    #[error("Unusable WebSocket upgrade request: {0}")]
    InvalidWebSocketUrl(String),

    // Upstream SOCKS5 hop
    #[error("SOCKS5 proxy {proxy}: {source}")]
    Socks5 {
        proxy: String,
        #[source]
        source: Socks5Error,
    },

    /// Connection type needs a cargo feature missing from this build
    #[error("{0} support is not compiled in")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether a later attempt with the same profile may succeed
    ///
    /// Network and handshake failures are retryable. A profile the chain
    /// cannot be built from, or credentials the upstream proxy refused, are
    /// not.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. }
            | Self::ConnectionRefused { .. }
            | Self::Timeout { .. }
            | Self::DnsResolutionFailed { .. }
            | Self::TlsHandshakeFailed { .. }
            | Self::HandshakeRejected { .. }
            | Self::WebSocketHandshakeFailed(_) => true,
            Self::SocketOption { .. }
            | Self::TlsConfigError(_)
            | Self::InvalidServerName(_)
            | Self::InvalidWebSocketUrl(_)
            | Self::Unsupported(_) => false,
            Self::Socks5 { source, .. } => !matches!(source, Socks5Error::AuthFailed),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::UnexpectedEof
            ),
        }
    }

    /// Map a failed dial, keeping refusals distinguishable
    pub fn from_connect(address: impl Into<String>, err: &io::Error) -> Self {
        let address = address.into();
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused { address },
            io::ErrorKind::TimedOut => Self::ConnectionFailed {
                address,
                reason: format!("timed out: {err}"),
            },
            _ => Self::ConnectionFailed {
                address,
                reason: err.to_string(),
            },
        }
    }

    pub fn connection_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(address: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            address: address.into(),
            timeout_ms,
        }
    }

    pub fn dns_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DnsResolutionFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    pub fn tls_config(msg: impl Into<String>) -> Self {
        Self::TlsConfigError(msg.into())
    }

    pub fn tls_handshake(server_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TlsHandshakeFailed {
            server_name: server_name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_server_name(name: impl Into<String>) -> Self {
        Self::InvalidServerName(name.into())
    }

    /// `response` is the proxy's status line, or why there was none
    pub fn rejected(response: impl Into<String>) -> Self {
        Self::HandshakeRejected {
            response: response.into(),
        }
    }

    pub fn websocket_handshake(msg: impl Into<String>) -> Self {
        Self::WebSocketHandshakeFailed(msg.into())
    }

    pub fn invalid_websocket_url(msg: impl Into<String>) -> Self {
        Self::InvalidWebSocketUrl(msg.into())
    }

    pub fn socks5(proxy: impl Into<String>, source: Socks5Error) -> Self {
        Self::Socks5 {
            proxy: proxy.into(),
            source,
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }
}
