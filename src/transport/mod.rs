//! Transport adapter chain
//!
//! The secure channel runs over exactly one outbound byte stream. This module
//! builds that stream through a stack of disguise layers, each wrapping an
//! inner [`Connector`]:
//!
//! ```text
//!   build_chain(TunnelConfig)
//!        |
//!        v
//!   WebSocketLayer | PayloadLayer      (optional, outermost)
//!        |
//!        v
//!   TlsLayer                           (optional, SNI override)
//!        |
//!        v
//!   Socks5Layer                        (optional, upstream proxy hop)
//!        |
//!        v
//!   TcpConnector                       (always, protected socket)
//! ```
//!
//! Every layer returns a [`BoxedStream`], so layers compose freely: TLS may
//! wrap the plain socket or sit beneath WebSocket framing.
//!
//! # Layers
//!
//! | Layer | Feature Flag | Purpose |
//! |-------|--------------|---------|
//! | TCP | (always) | Protected socket, keepalive, nodelay |
//! | TLS | `transport-tls` | ClientHello with the SNI override |
//! | Payload | (always) | HTTP request injection, expects ` 200 ` |
//! | WebSocket | `transport-ws` | Upgrade, then binary message framing |
//! | SOCKS5 | (always) | CONNECT through an upstream proxy |

mod chain;
mod error;
mod payload;
mod socks5;
mod tcp;

#[cfg(feature = "transport-tls")]
mod tls;

#[cfg(feature = "transport-ws")]
mod websocket;

pub use chain::build_chain;
pub use error::TransportError;
pub use payload::{render_payload, PayloadLayer, MAX_RESPONSE_HEAD};
pub use socks5::Socks5Layer;
pub use tcp::TcpConnector;

#[cfg(feature = "transport-tls")]
pub use tls::TlsLayer;

#[cfg(feature = "transport-ws")]
pub use websocket::{WebSocketLayer, WebSocketPipe};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream usable by any layer
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased stream returned by every connector
pub type BoxedStream = Box<dyn AsyncStream>;

impl fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BoxedStream")
    }
}

/// Shared connector handle
pub type SharedConnector = Arc<dyn Connector>;

/// One layer of the disguise chain
///
/// A connector either opens a socket (the innermost layer) or asks its inner
/// connector for a stream and performs its own handshake on top of it.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Establish the stream
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if this layer or any inner layer fails.
    async fn connect(&self) -> Result<BoxedStream, TransportError>;

    /// Human-readable description of the chain from this layer down
    fn describe(&self) -> String;
}

/// Socket-level settings for the innermost TCP connection
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Remote host (hostname or IP address)
    pub address: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Enable TCP keepalive
    pub tcp_keepalive: bool,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl TransportConfig {
    /// Create a new TCP transport configuration
    ///
    /// # Example
    ///
    /// ```
    /// use disguise_tunnel::transport::TransportConfig;
    ///
    /// let config = TransportConfig::tcp("example.com", 443);
    /// assert_eq!(config.address_string(), "example.com:443");
    /// ```
    #[must_use]
    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            connect_timeout: Duration::from_secs(30),
            tcp_keepalive: true,
            tcp_nodelay: true,
        }
    }

    /// Set connection timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set TCP keepalive option
    #[must_use]
    pub fn with_keepalive(mut self, enabled: bool) -> Self {
        self.tcp_keepalive = enabled;
        self
    }

    /// Set TCP_NODELAY option
    #[must_use]
    pub fn with_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Get the full address string (host:port)
    #[must_use]
    pub fn address_string(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Timeout in whole milliseconds, for error reporting
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// TLS configuration for the TLS layer
///
/// # Example
///
/// ```
/// use disguise_tunnel::transport::TlsConfig;
///
/// let config = TlsConfig::new("front.example.com");
/// assert!(!config.verify_certificate);
/// ```
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Server name presented in the ClientHello
    pub server_name: String,

    /// Verify the certificate chain against the web PKI roots
    pub verify_certificate: bool,
}

impl TlsConfig {
    /// Create a new TLS configuration with server name
    #[must_use]
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            verify_certificate: false,
        }
    }

    /// Require a certificate chain valid for `server_name`
    #[must_use]
    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verify_certificate = enabled;
        self
    }
}

/// WebSocket upgrade request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Request path (e.g., "/ws")
    pub path: String,

    /// Host header value
    pub host: String,

    /// Additional HTTP headers for the handshake
    pub headers: Vec<(String, String)>,
}

impl WebSocketConfig {
    /// Create a WebSocket configuration with path and Host header
    #[must_use]
    pub fn new(path: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            host: host.into(),
            headers: Vec::new(),
        }
    }

    /// Add a custom header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Derive the upgrade request from a rendered payload
    ///
    /// The path comes from the request line; every other `Name: value` line
    /// becomes a header except Host, Upgrade and Connection, which the
    /// handshake sets itself. Host is the SNI override when given, else
    /// `host:port` of the dialed endpoint.
    #[must_use]
    pub fn from_payload(payload: &str, sni: Option<&str>, host: &str, port: u16) -> Self {
        let normalized = payload.replace("\\r\\n", "\r\n");
        let mut lines = normalized.split("\r\n");

        let path = lines
            .next()
            .and_then(|request_line| request_line.split_whitespace().nth(1))
            .filter(|path| path.starts_with('/'))
            .unwrap_or("/")
            .to_string();

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim(), value.trim()))
            .filter(|(name, _)| {
                !name.is_empty()
                    && !name.eq_ignore_ascii_case("host")
                    && !name.eq_ignore_ascii_case("upgrade")
                    && !name.eq_ignore_ascii_case("connection")
            })
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();

        let host = match sni {
            Some(sni) if !sni.trim().is_empty() => sni.trim().to_string(),
            _ => format!("{host}:{port}"),
        };

        Self {
            path,
            host,
            headers,
        }
    }
}
