//! Upstream SOCKS5 hop
//!
//! Opens the inner stream to the proxy and issues a CONNECT for the
//! secure-channel endpoint. Everything layered above sees the proxied stream.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use super::{BoxedStream, Connector, SharedConnector, TransportError};
use crate::socks5::{self, Socks5Auth, TargetAddr};

/// SOCKS5 CONNECT over an inner connector
#[derive(Debug)]
pub struct Socks5Layer {
    inner: SharedConnector,
    proxy: String,
    target: TargetAddr,
    auth: Option<Socks5Auth>,
    negotiation_timeout: Duration,
}

impl Socks5Layer {
    /// Create a layer that asks `proxy` to connect to `host:port`
    #[must_use]
    pub fn new(
        inner: SharedConnector,
        proxy: impl Into<String>,
        host: &str,
        port: u16,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            proxy: proxy.into(),
            target: TargetAddr::from_host(host, port),
            auth: None,
            negotiation_timeout,
        }
    }

    /// Authenticate with username and password
    #[must_use]
    pub fn with_auth(mut self, auth: Socks5Auth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Address requested from the proxy
    #[must_use]
    pub fn target(&self) -> &TargetAddr {
        &self.target
    }
}

#[async_trait]
impl Connector for Socks5Layer {
    async fn connect(&self) -> Result<BoxedStream, TransportError> {
        let mut stream = self.inner.connect().await?;

        let bound = timeout(
            self.negotiation_timeout,
            socks5::connect(&mut stream, &self.target, self.auth.as_ref()),
        )
        .await
        .map_err(|_| {
            TransportError::timeout(
                format!("SOCKS5 negotiation with {}", self.proxy),
                u64::try_from(self.negotiation_timeout.as_millis()).unwrap_or(u64::MAX),
            )
        })?
        .map_err(|e| TransportError::socks5(&self.proxy, e))?;

        tracing::debug!(
            proxy = %self.proxy,
            target = %self.target,
            bound = %bound,
            "SOCKS5 tunnel established"
        );

        Ok(stream)
    }

    fn describe(&self) -> String {
        format!("socks5({}) -> {}", self.target, self.inner.describe())
    }
}
