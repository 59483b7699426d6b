//! SOCKS5 client handshake (RFC 1928, RFC 1929)
//!
//! Two places speak SOCKS5 as a client: the flow dialer, which asks the
//! secure channel's dynamic forwarding port to CONNECT to each flow's
//! destination, and the upstream proxy connector in the transport chain.
//! Both go through [`connect`], which works over any async byte stream.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

// ============================================================================
// Protocol constants
// ============================================================================

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
pub const AUTH_METHOD_NONE: u8 = 0x00;

/// Username/password authentication (RFC 1929)
pub const AUTH_METHOD_PASSWORD: u8 = 0x02;

/// Server rejected every offered method
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password sub-negotiation version
pub const AUTH_PASSWORD_VERSION: u8 = 0x01;

/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;

/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;

/// Domain name address type
pub const ATYP_DOMAIN: u8 = 0x03;

/// IPv6 address type
pub const ATYP_IPV6: u8 = 0x04;

/// Reply: succeeded
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Reply: connection refused
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;

/// Human-readable text for a CONNECT reply code
#[must_use]
pub const fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

// ============================================================================
// Types
// ============================================================================

/// SOCKS5 client errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    /// Peer answered with a different protocol version
    #[error("invalid SOCKS version: expected {expected}, got {actual}")]
    InvalidVersion {
        /// Expected version
        expected: u8,
        /// Received version
        actual: u8,
    },

    /// Server accepted none of the offered methods
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    /// Username/password rejected
    #[error("SOCKS5 authentication failed")]
    AuthFailed,

    /// CONNECT reply carried a failure code
    #[error("SOCKS5 server error (code {code:#04x}): {message}")]
    ServerReply {
        /// Reply code
        code: u8,
        /// Reply text
        message: String,
    },

    /// Unknown address type in a reply
    #[error("invalid address type: {0:#04x}")]
    InvalidAddressType(u8),

    /// Malformed message or oversized field
    #[error("SOCKS5 protocol error: {0}")]
    Protocol(String),

    /// Stream read or write failed
    #[error("SOCKS5 I/O error: {0}")]
    Io(String),
}

impl Socks5Error {
    /// True when the proxy reported the destination refused the connection
    #[must_use]
    pub fn is_refused(&self) -> bool {
        matches!(self, Self::ServerReply { code, .. } if *code == REPLY_CONNECTION_REFUSED)
    }
}

/// CONNECT destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal socket address
    Ip(SocketAddr),
    /// Hostname resolved by the proxy
    Domain(String, u16),
}

impl TargetAddr {
    /// Build a target from a host string, keeping IP literals as addresses
    #[must_use]
    pub fn from_host(host: &str, port: u16) -> Self {
        match host.parse() {
            Ok(ip) => Self::Ip(SocketAddr::new(ip, port)),
            Err(_) => Self::Domain(host.to_string(), port),
        }
    }

    /// Destination port
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl From<SocketAddrV4> for TargetAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self::Ip(SocketAddr::V4(addr))
    }
}

/// Optional RFC 1929 credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Socks5Auth {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Socks5Auth {
    /// Create credentials
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Socks5Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socks5Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Run method selection, optional authentication and CONNECT on `stream`
///
/// On success the stream is positioned at the start of the relayed data and
/// the proxy's bound address is returned.
///
/// # Errors
///
/// Returns `Socks5Error` on any protocol violation, rejection or I/O error.
pub async fn connect<S>(
    stream: &mut S,
    target: &TargetAddr,
    auth: Option<&Socks5Auth>,
) -> Result<SocketAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, auth).await?;

    let request = build_connect_request(target)?;
    trace!(target = %target, "Sending SOCKS5 CONNECT");
    stream
        .write_all(&request)
        .await
        .map_err(|e| Socks5Error::Io(format!("write connect request failed: {e}")))?;

    read_connect_reply(stream).await
}

async fn negotiate_method<S>(stream: &mut S, auth: Option<&Socks5Auth>) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let methods: &[u8] = if auth.is_some() {
        &[SOCKS5_VERSION, 2, AUTH_METHOD_NONE, AUTH_METHOD_PASSWORD]
    } else {
        &[SOCKS5_VERSION, 1, AUTH_METHOD_NONE]
    };

    stream
        .write_all(methods)
        .await
        .map_err(|e| Socks5Error::Io(format!("write methods failed: {e}")))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Socks5Error::Io(format!("read method response failed: {e}")))?;

    if response[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: response[0],
        });
    }

    match (response[1], auth) {
        (AUTH_METHOD_NONE, _) => Ok(()),
        (AUTH_METHOD_PASSWORD, Some(auth)) => authenticate(stream, auth).await,
        (AUTH_METHOD_PASSWORD, None) | (AUTH_METHOD_NO_ACCEPTABLE, _) => {
            Err(Socks5Error::NoAcceptableMethod)
        }
        (other, _) => Err(Socks5Error::Protocol(format!(
            "unsupported auth method: {other:#04x}"
        ))),
    }
}

async fn authenticate<S>(stream: &mut S, auth: &Socks5Auth) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ulen = u8::try_from(auth.username.len())
        .map_err(|_| Socks5Error::Protocol("username too long (max 255)".into()))?;
    let plen = u8::try_from(auth.password.len())
        .map_err(|_| Socks5Error::Protocol("password too long (max 255)".into()))?;

    // VER | ULEN | USERNAME | PLEN | PASSWORD
    let mut request = Vec::with_capacity(3 + auth.username.len() + auth.password.len());
    request.push(AUTH_PASSWORD_VERSION);
    request.push(ulen);
    request.extend_from_slice(auth.username.as_bytes());
    request.push(plen);
    request.extend_from_slice(auth.password.as_bytes());

    stream
        .write_all(&request)
        .await
        .map_err(|e| Socks5Error::Io(format!("write auth failed: {e}")))?;

    let mut response = [0u8; 2];
    stream
        .read_exact(&mut response)
        .await
        .map_err(|e| Socks5Error::Io(format!("read auth response failed: {e}")))?;

    if response[0] != AUTH_PASSWORD_VERSION {
        return Err(Socks5Error::Protocol(format!(
            "invalid auth version: {:#04x}",
            response[0]
        )));
    }
    if response[1] != 0x00 {
        return Err(Socks5Error::AuthFailed);
    }

    Ok(())
}

/// Encode a CONNECT request for `target`
///
/// # Errors
///
/// Returns `Socks5Error::Protocol` for domain names longer than 255 bytes.
pub fn build_connect_request(target: &TargetAddr) -> Result<Vec<u8>, Socks5Error> {
    let mut request = Vec::with_capacity(22);
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);

    match target {
        TargetAddr::Ip(SocketAddr::V4(v4)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&v4.ip().octets());
        }
        TargetAddr::Ip(SocketAddr::V6(v6)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&v6.ip().octets());
        }
        TargetAddr::Domain(host, _) => {
            let len = u8::try_from(host.len())
                .map_err(|_| Socks5Error::Protocol("domain name too long (max 255)".into()))?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }

    request.extend_from_slice(&target.port().to_be_bytes());
    Ok(request)
}

async fn read_connect_reply<S>(stream: &mut S) -> Result<SocketAddr, Socks5Error>
where
    S: AsyncRead + Unpin,
{
    // VER | REP | RSV | ATYP
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Socks5Error::Io(format!("read reply header failed: {e}")))?;

    if header[0] != SOCKS5_VERSION {
        return Err(Socks5Error::InvalidVersion {
            expected: SOCKS5_VERSION,
            actual: header[0],
        });
    }
    if header[1] != REPLY_SUCCEEDED {
        return Err(Socks5Error::ServerReply {
            code: header[1],
            message: reply_message(header[1]).to_string(),
        });
    }

    let ip = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            read_field(stream, &mut addr, "IPv4 addr").await?;
            std::net::IpAddr::V4(Ipv4Addr::from(addr))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            read_field(stream, &mut addr, "IPv6 addr").await?;
            std::net::IpAddr::V6(Ipv6Addr::from(addr))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_field(stream, &mut len, "domain len").await?;
            let mut domain = vec![0u8; usize::from(len[0])];
            read_field(stream, &mut domain, "domain").await?;
            std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        }
        other => return Err(Socks5Error::InvalidAddressType(other)),
    };

    let mut port = [0u8; 2];
    read_field(stream, &mut port, "port").await?;
    let port = u16::from_be_bytes(port);

    let bound = match ip {
        std::net::IpAddr::V4(v4) => SocketAddr::V4(SocketAddrV4::new(v4, port)),
        std::net::IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(v6, port, 0, 0)),
    };
    trace!(bound = %bound, "SOCKS5 CONNECT succeeded");
    Ok(bound)
}

async fn read_field<S>(stream: &mut S, buf: &mut [u8], what: &str) -> Result<(), Socks5Error>
where
    S: AsyncRead + Unpin,
{
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| Socks5Error::Io(format!("read {what} failed: {e}")))
}
