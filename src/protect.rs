//! Socket protection for tunnel-owned connections
//!
//! While the virtual interface captures all device traffic, the sockets the
//! tunnel itself opens (the outbound disguise connection and the loopback
//! proxy connections) must not be routed back into it. The platform decides
//! how: Android exposes a `protect(fd)` call, Linux policy routing uses
//! `SO_MARK`. Every socket is handed to a [`SocketProtector`] before it
//! connects.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// Hook applied to every socket the tunnel opens, before `connect`
pub trait SocketProtector: Send + Sync + fmt::Debug {
    /// Exclude `socket` from the virtual interface
    ///
    /// # Errors
    ///
    /// Returns the OS error when the socket cannot be protected; the
    /// connection attempt is abandoned.
    fn protect(&self, socket: SockRef<'_>) -> io::Result<()>;
}

/// Shared protector handle
pub type SharedProtector = Arc<dyn SocketProtector>;

/// Protector that leaves sockets untouched (tests, desktop use)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProtector;

impl SocketProtector for NoopProtector {
    fn protect(&self, _socket: SockRef<'_>) -> io::Result<()> {
        Ok(())
    }
}

/// Protector that sets `SO_MARK` for policy routing
#[cfg(any(target_os = "linux", target_os = "android"))]
#[derive(Debug, Clone, Copy)]
pub struct FwmarkProtector {
    mark: u32,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl FwmarkProtector {
    /// Create a protector applying `mark`
    #[must_use]
    pub const fn new(mark: u32) -> Self {
        Self { mark }
    }

    /// Routing mark
    #[must_use]
    pub const fn mark(&self) -> u32 {
        self.mark
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl SocketProtector for FwmarkProtector {
    fn protect(&self, socket: SockRef<'_>) -> io::Result<()> {
        socket.set_mark(self.mark)?;
        debug!(mark = self.mark, "Set routing mark");
        Ok(())
    }
}

/// Default protector: no-op
#[must_use]
pub fn default_protector() -> SharedProtector {
    Arc::new(NoopProtector)
}

/// Open a protected TCP connection to `addr` within `connect_timeout`
///
/// # Errors
///
/// Returns the protector's error, `TimedOut` when the deadline passes, or
/// the connect error.
pub async fn connect_protected(
    addr: SocketAddr,
    protector: &dyn SocketProtector,
    connect_timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    protector.protect(SockRef::from(&socket))?;

    timeout(connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out after {}ms", connect_timeout.as_millis()),
            )
        })?
}
