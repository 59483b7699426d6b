//! Plain TCP connector, the innermost layer of every chain
//!
//! Resolves the target asynchronously, opens each candidate socket through
//! the configured [`SocketProtector`](crate::protect::SocketProtector) and
//! applies keepalive and nodelay options once connected.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{lookup_host, TcpStream};

use super::{BoxedStream, Connector, TransportConfig, TransportError};
use crate::protect::{connect_protected, SharedProtector};

/// TCP connector for the chain's outbound socket
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: TransportConfig,
    protector: SharedProtector,
}

impl TcpConnector {
    /// Create a connector for `config`, protecting sockets with `protector`
    #[must_use]
    pub fn new(config: TransportConfig, protector: SharedProtector) -> Self {
        Self { config, protector }
    }

    /// Socket-level configuration
    #[must_use]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Resolve hostname to socket addresses
    async fn resolve_address(address: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
        let addr_str = format!("{address}:{port}");

        // IP literals skip the resolver
        if let Ok(ip) = address.parse::<std::net::IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs: Vec<SocketAddr> = lookup_host((address, port))
            .await
            .map_err(|e| TransportError::dns_failed(&addr_str, e.to_string()))?
            .collect();

        if addrs.is_empty() {
            return Err(TransportError::dns_failed(
                &addr_str,
                "no addresses returned",
            ));
        }

        Ok(addrs)
    }

    /// Configure TCP socket options
    fn configure_socket(stream: &TcpStream, config: &TransportConfig) -> Result<(), TransportError> {
        if config.tcp_nodelay {
            stream
                .set_nodelay(true)
                .map_err(|e| TransportError::socket_option("TCP_NODELAY", e.to_string()))?;
        }

        if config.tcp_keepalive {
            let socket_ref = SockRef::from(stream);
            let keepalive = TcpKeepalive::new()
                .with_time(Duration::from_secs(60))
                .with_interval(Duration::from_secs(20));

            #[cfg(any(target_os = "linux", target_os = "android"))]
            let keepalive = keepalive.with_retries(3);

            socket_ref
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| TransportError::socket_option("TCP_KEEPALIVE", e.to_string()))?;
        }

        Ok(())
    }

    /// Connect to a single address with timeout
    async fn connect_to_addr(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        connect_protected(addr, self.protector.as_ref(), self.config.connect_timeout)
            .await
            .map_err(|e| {
                if e.kind() == io::ErrorKind::TimedOut {
                    TransportError::timeout(addr.to_string(), self.config.timeout_ms())
                } else {
                    TransportError::from_connect(addr.to_string(), &e)
                }
            })
    }

    /// Open the socket without boxing it
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if resolution, every connection attempt or
    /// socket configuration fails.
    pub async fn connect_stream(&self) -> Result<TcpStream, TransportError> {
        let addrs = Self::resolve_address(&self.config.address, self.config.port).await?;

        let mut last_error = None;

        for addr in addrs {
            match self.connect_to_addr(addr).await {
                Ok(stream) => {
                    Self::configure_socket(&stream, &self.config)?;

                    tracing::debug!(
                        addr = %addr,
                        nodelay = self.config.tcp_nodelay,
                        keepalive = self.config.tcp_keepalive,
                        "TCP connection established"
                    );

                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(
                        addr = %addr,
                        error = %e,
                        "TCP connection attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::connection_failed(
                self.config.address_string(),
                "no addresses to connect to",
            )
        }))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let stream = self.connect_stream().await?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("tcp({})", self.config.address_string())
    }
}
