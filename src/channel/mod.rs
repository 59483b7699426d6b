//! Secure channel seam
//!
//! The authenticated channel protocol itself lives outside this crate. The
//! controller drives it through [`SecureChannel`]: connect over the disguise
//! chain, start dynamic (SOCKS) forwarding on a loopback port, wait for the
//! session to end, disconnect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::TunnelTunables;
use crate::error::ChannelError;
use crate::transport::SharedConnector;

/// Compression algorithms offered when compression is enabled
pub const COMPRESSION_ALGORITHMS: &str = "zlib@openssh.com,zlib,none";

/// Keepalive probe interval when keepalive is enabled
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Login credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create credentials
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session options derived from the tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Offered compression algorithms, `None` for no compression
    pub compression: Option<&'static str>,
    /// Keepalive probe interval, `None` to disable probes
    pub keepalive_interval: Option<Duration>,
    /// Disable Nagle on the channel's socket
    pub tcp_nodelay: bool,
}

impl ChannelOptions {
    /// Map tunables to channel options
    #[must_use]
    pub fn from_tunables(tunables: &TunnelTunables) -> Self {
        Self {
            compression: tunables.use_compression.then_some(COMPRESSION_ALGORITHMS),
            keepalive_interval: tunables.use_keep_alive.then_some(KEEPALIVE_INTERVAL),
            tcp_nodelay: tunables.use_tcp_no_delay,
        }
    }
}

/// Everything a channel needs to connect
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Secure-channel server host, as the server knows itself
    pub host: String,
    /// Secure-channel server port
    pub port: u16,
    /// Login credentials
    pub credentials: Credentials,
    /// Outbound transport; the channel must connect through it
    pub transport: SharedConnector,
    /// Session options
    pub options: ChannelOptions,
}

/// Authenticated channel carrying the tunnel
///
/// All methods may be called from any task. `disconnect` must be idempotent
/// and must make a pending `closed` resolve.
#[async_trait]
pub trait SecureChannel: Send + Sync + fmt::Debug {
    /// Connect through `request.transport` and authenticate
    ///
    /// # Errors
    ///
    /// Returns `ChannelError` if the transport, the handshake or
    /// authentication fails.
    async fn connect(&self, request: ConnectRequest) -> Result<(), ChannelError>;

    /// Start a SOCKS proxy on loopback `port`, returning the bound port
    ///
    /// # Errors
    ///
    /// Returns `ChannelError::Forwarding` if the port cannot be bound.
    async fn start_dynamic_forwarding(&self, port: u16) -> Result<u16, ChannelError>;

    /// Tear the session down
    async fn disconnect(&self);

    /// Whether the session is up
    fn is_connected(&self) -> bool;

    /// Resolve when the session ends, with the reason
    async fn closed(&self) -> String;
}

/// Creates a fresh channel for each connection attempt
pub trait SecureChannelFactory: Send + Sync + fmt::Debug {
    /// Create an unconnected channel
    fn create(&self) -> Arc<dyn SecureChannel>;
}
