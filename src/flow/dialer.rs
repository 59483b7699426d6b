//! Proxy-side connections for flow sessions

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::SessionError;
use crate::packet::IpProtocol;
use crate::protect::{connect_protected, SharedProtector};
use crate::socks5::{self, TargetAddr};
use crate::transport::BoxedStream;

/// Opens the proxy connection carrying one flow
#[async_trait]
pub trait ProxyDialer: Send + Sync + fmt::Debug {
    /// Connect to the proxy and ask it for `destination`
    ///
    /// # Errors
    ///
    /// Returns `SessionError` if the proxy is not ready, unreachable or
    /// refuses the destination.
    async fn dial(&self, destination: SocketAddrV4) -> Result<BoxedStream, SessionError>;

    /// Whether flows of `protocol` can be carried
    fn supports(&self, protocol: IpProtocol) -> bool;
}

/// Shared dialer handle
pub type SharedDialer = Arc<dyn ProxyDialer>;

/// Dialer for the secure channel's loopback SOCKS5 port
///
/// Reads the port from the controller's watch channel at dial time, so flows
/// opened before the tunnel is ready fail fast with `NotReady`. Carries TCP
/// only.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    port: watch::Receiver<Option<u16>>,
    protector: SharedProtector,
    connect_timeout: Duration,
}

impl Socks5Dialer {
    /// Create a dialer following the published forwarding port
    #[must_use]
    pub fn new(
        port: watch::Receiver<Option<u16>>,
        protector: SharedProtector,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            port,
            protector,
            connect_timeout,
        }
    }

    /// Create a dialer for a fixed port
    #[must_use]
    pub fn fixed(port: u16, protector: SharedProtector, connect_timeout: Duration) -> Self {
        let (_tx, rx) = watch::channel(Some(port));
        Self::new(rx, protector, connect_timeout)
    }
}

#[async_trait]
impl ProxyDialer for Socks5Dialer {
    async fn dial(&self, destination: SocketAddrV4) -> Result<BoxedStream, SessionError> {
        let port = (*self.port.borrow()).ok_or(SessionError::NotReady)?;
        let proxy = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        let mut stream = connect_protected(proxy, self.protector.as_ref(), self.connect_timeout)
            .await
            .map_err(|e| SessionError::dial(proxy.to_string(), e.to_string()))?;
        // Ignored on failure; latency only
        let _ = stream.set_nodelay(true);

        socks5::connect(&mut stream, &TargetAddr::from(destination), None)
            .await
            .map_err(|e| SessionError::proxy(destination.to_string(), e))?;

        tracing::trace!(proxy = %proxy, destination = %destination, "Flow proxy connected");
        Ok(Box::new(stream))
    }

    fn supports(&self, protocol: IpProtocol) -> bool {
        protocol == IpProtocol::Tcp
    }
}
