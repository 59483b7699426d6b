//! Flow session table
//!
//! Maps each flow seen on the virtual interface to one connection through
//! the local SOCKS proxy. Requests travel interface -> [`FlowTable`] ->
//! session worker -> proxy; replies travel proxy -> reply reader ->
//! [`build_reply`](crate::packet::build_reply) -> [`InterfaceWriter`].

mod dialer;
mod table;
mod writer;

pub use dialer::{ProxyDialer, SharedDialer, Socks5Dialer};
pub use table::{FlowSession, FlowTable, SESSION_QUEUE_CAPACITY};
pub use writer::InterfaceWriter;

use std::fmt;
use std::net::SocketAddrV4;

use crate::packet::{IpProtocol, Packet};

/// Flow identity as seen from the device side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Transport protocol
    pub protocol: IpProtocol,
    /// Device-side address
    pub source: SocketAddrV4,
    /// Remote address
    pub destination: SocketAddrV4,
}

impl FlowKey {
    /// Create a key
    #[must_use]
    pub const fn new(protocol: IpProtocol, source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        Self {
            protocol,
            source,
            destination,
        }
    }

    /// Key of the flow `packet` belongs to
    #[must_use]
    pub fn of(packet: &Packet) -> Self {
        Self::new(packet.protocol(), packet.source(), packet.destination())
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.destination)
    }
}
