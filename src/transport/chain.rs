//! Chain assembly from a tunnel profile
//!
//! | Effective type | Chain (outermost first) |
//! |----------------|-------------------------|
//! | `direct` | tcp |
//! | `ssl` | tls, tcp |
//! | `payload` | payload, tcp |
//! | `payload_ssl` | payload, tls, tcp |
//! | `websocket` | websocket, tcp |
//! | `websocket_ssl` | websocket, tls, tcp |
//! | `socks5` | socks5, tcp |
//!
//! The TCP layer dials the proxy when one is configured, otherwise the
//! secure-channel server itself.

use std::sync::Arc;
use std::time::Duration;

use super::{
    PayloadLayer, SharedConnector, Socks5Layer, TcpConnector, TransportConfig, TransportError,
};
use crate::config::{ConnectionType, TunnelConfig, TunnelTunables};
use crate::protect::SharedProtector;

#[cfg(feature = "transport-tls")]
use super::{TlsConfig, TlsLayer};

#[cfg(feature = "transport-ws")]
use super::{render_payload, WebSocketConfig, WebSocketLayer};

/// Build the connector chain for `config`
///
/// `connect_timeout` bounds the TCP connect and every handshake above it
/// separately.
///
/// # Errors
///
/// Returns `TransportError::Unsupported` when the profile needs a layer this
/// build was compiled without, or `TransportError::TlsConfigError` if the TLS
/// client configuration cannot be built.
pub fn build_chain(
    config: &TunnelConfig,
    tunables: &TunnelTunables,
    protector: SharedProtector,
    connect_timeout: Duration,
) -> Result<SharedConnector, TransportError> {
    let kind = config.effective_connection_type();
    let (dial_host, dial_port) = config.dial_target();

    let transport = TransportConfig::tcp(dial_host.clone(), dial_port)
        .with_timeout(connect_timeout)
        .with_keepalive(tunables.use_keep_alive)
        .with_nodelay(tunables.use_tcp_no_delay);
    let tcp: SharedConnector = Arc::new(TcpConnector::new(transport, protector));

    let chain: SharedConnector = match kind {
        ConnectionType::Direct => tcp,
        ConnectionType::Socks5 => Arc::new(Socks5Layer::new(
            tcp,
            format!("{dial_host}:{dial_port}"),
            &config.ssh_host,
            config.ssh_port,
            connect_timeout,
        )),
        ConnectionType::Payload => Arc::new(PayloadLayer::new(
            tcp,
            &config.payload,
            &config.ssh_host,
            config.ssh_port,
            connect_timeout,
        )),
        ConnectionType::Ssl => tls_layer(tcp, config, &dial_host, connect_timeout)?,
        ConnectionType::PayloadSsl => {
            let tls = tls_layer(tcp, config, &dial_host, connect_timeout)?;
            Arc::new(PayloadLayer::new(
                tls,
                &config.payload,
                &config.ssh_host,
                config.ssh_port,
                connect_timeout,
            ))
        }
        ConnectionType::Websocket => {
            websocket_layer(tcp, config, &dial_host, dial_port, false, connect_timeout)?
        }
        ConnectionType::WebsocketSsl => {
            let tls = tls_layer(tcp, config, &dial_host, connect_timeout)?;
            websocket_layer(tls, config, &dial_host, dial_port, true, connect_timeout)?
        }
    };

    tracing::debug!(
        profile = %config.id,
        connection_type = %kind,
        chain = %chain.describe(),
        "Transport chain built"
    );

    Ok(chain)
}

#[cfg(feature = "transport-tls")]
fn tls_layer(
    inner: SharedConnector,
    config: &TunnelConfig,
    dial_host: &str,
    handshake_timeout: Duration,
) -> Result<SharedConnector, TransportError> {
    let server_name = config.sni_override().unwrap_or(dial_host);
    let tls = TlsConfig::new(server_name).with_verification(config.verify_certificate);
    Ok(Arc::new(TlsLayer::new(inner, tls, handshake_timeout)?))
}

#[cfg(not(feature = "transport-tls"))]
fn tls_layer(
    _inner: SharedConnector,
    config: &TunnelConfig,
    _dial_host: &str,
    _handshake_timeout: Duration,
) -> Result<SharedConnector, TransportError> {
    Err(TransportError::unsupported(format!(
        "{} requires the transport-tls feature",
        config.effective_connection_type()
    )))
}

#[cfg(feature = "transport-ws")]
fn websocket_layer(
    inner: SharedConnector,
    config: &TunnelConfig,
    dial_host: &str,
    dial_port: u16,
    secure: bool,
    handshake_timeout: Duration,
) -> Result<SharedConnector, TransportError> {
    let rendered = render_payload(&config.payload, &config.ssh_host, config.ssh_port);
    let ws = WebSocketConfig::from_payload(&rendered, config.sni_override(), dial_host, dial_port);
    Ok(Arc::new(WebSocketLayer::new(inner, ws, secure, handshake_timeout)))
}

#[cfg(not(feature = "transport-ws"))]
fn websocket_layer(
    _inner: SharedConnector,
    config: &TunnelConfig,
    _dial_host: &str,
    _dial_port: u16,
    _secure: bool,
    _handshake_timeout: Duration,
) -> Result<SharedConnector, TransportError> {
    Err(TransportError::unsupported(format!(
        "{} requires the transport-ws feature",
        config.effective_connection_type()
    )))
}
