//! Packet codec for raw frames read from the virtual interface
//!
//! This module parses IPv4 frames carrying TCP or UDP into structured,
//! immutable views and serializes proxy reply payloads back into IPv4 frames
//! that the device's network stack accepts.
//!
//! # Parsing
//!
//! ```text
//! RawFrame (Bytes)
//!     |
//!     v
//!  parse() ──> Packet { Ipv4Header, TransportHeader, payload, header bytes }
//! ```
//!
//! Only IPv4 is supported. Anything else (IPv6, other protocols, truncated
//! headers) is reported as a [`PacketError`] and the caller drops the frame.
//!
//! # Replies
//!
//! [`build_reply`] uses the packet that opened a flow as a template: the
//! addresses and ports are swapped, a fresh IPv4 header is written with a
//! correct header checksum, and the payload is appended. TCP sequence and
//! acknowledgment numbers and the TCP checksum are left at zero; replies are
//! relayed best-effort without TCP state tracking.

mod checksum;

pub use checksum::{
    fill_ipv4_checksum, internet_checksum, verify_ipv4_checksum, IPV4_MIN_HEADER_LEN,
};

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Fixed TCP header length (no options)
pub const TCP_HEADER_LEN: usize = 20;

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// Largest payload [`build_reply`] accepts: the IPv4 total length field is
/// 16 bits and the reply carries at most a 20-byte IP and 20-byte TCP header.
pub const MAX_REPLY_PAYLOAD: usize = u16::MAX as usize - IPV4_MIN_HEADER_LEN - TCP_HEADER_LEN;

const IPV4_FLAG_DONT_FRAGMENT: u16 = 0x4000;
const REPLY_TTL: u8 = 64;
const TCP_FLAGS_ACK_PSH: u8 = 0x18;
const TCP_REPLY_WINDOW: u16 = 0xFFFF;

/// Packet parsing and serialization errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Frame shorter than the minimum IPv4 header
    #[error("frame too short: {len} bytes")]
    TooShort {
        /// Frame length
        len: usize,
    },

    /// IP version other than 4
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// IHL below 5 words
    #[error("invalid IPv4 header length {0}")]
    InvalidHeaderLength(usize),

    /// Header or transport header runs past the end of the frame
    #[error("truncated {layer} header: need {needed} bytes, have {available}")]
    Truncated {
        /// Which layer was truncated
        layer: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Transport protocol other than TCP or UDP
    #[error("unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),

    /// Reply payload does not fit in a single IPv4 frame
    #[error("reply payload of {0} bytes exceeds the IPv4 length limit")]
    PayloadTooLarge(usize),
}

/// Transport protocols carried by parsed packets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpProtocol {
    /// TCP (6)
    Tcp = 6,
    /// UDP (17)
    Udp = 17,
}

impl IpProtocol {
    /// Map an IPv4 protocol number
    #[must_use]
    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }

    /// IPv4 protocol number
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("TCP"),
            Self::Udp => f.write_str("UDP"),
        }
    }
}

/// Parsed IPv4 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    /// IP version (always 4)
    pub version: u8,
    /// Transport protocol
    pub protocol: IpProtocol,
    /// Source address
    pub source: Ipv4Addr,
    /// Destination address
    pub destination: Ipv4Addr,
    /// Header length in bytes (IHL * 4)
    pub header_len: usize,
    raw: Bytes,
}

impl Ipv4Header {
    /// Original header bytes, options included
    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }
}

/// Parsed TCP or UDP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHeader {
    /// Which transport this header belongs to
    pub protocol: IpProtocol,
    /// Source port
    pub source_port: u16,
    /// Destination port
    pub destination_port: u16,
    raw: Bytes,
}

impl TransportHeader {
    /// Original header bytes (TCP options included)
    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Header length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Always false for a parsed header
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// An immutable parsed frame
///
/// Cloning is cheap: every byte view shares the frame's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    ip: Ipv4Header,
    transport: TransportHeader,
    payload: Bytes,
    headers: Bytes,
}

impl Packet {
    /// Parse a frame that is already owned as `Bytes`
    ///
    /// # Errors
    ///
    /// Returns `PacketError` for anything other than a complete IPv4/TCP or
    /// IPv4/UDP frame.
    pub fn from_frame(frame: Bytes) -> Result<Self, PacketError> {
        if frame.len() < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::TooShort { len: frame.len() });
        }

        let version = frame[0] >> 4;
        if version != 4 {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let header_len = usize::from(frame[0] & 0x0F) * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::InvalidHeaderLength(header_len));
        }
        if header_len > frame.len() {
            return Err(PacketError::Truncated {
                layer: "IPv4",
                needed: header_len,
                available: frame.len(),
            });
        }

        let protocol =
            IpProtocol::from_number(frame[9]).ok_or(PacketError::UnsupportedProtocol(frame[9]))?;
        let source = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
        let destination = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);

        // Trim link-layer padding when the total length field is consistent
        let total_len = usize::from(u16::from_be_bytes([frame[2], frame[3]]));
        let end = if (header_len..=frame.len()).contains(&total_len) {
            total_len
        } else {
            frame.len()
        };

        let segment = &frame[header_len..end];
        let transport_len = match protocol {
            IpProtocol::Tcp => {
                if segment.len() < TCP_HEADER_LEN {
                    return Err(PacketError::Truncated {
                        layer: "TCP",
                        needed: TCP_HEADER_LEN,
                        available: segment.len(),
                    });
                }
                let data_offset = usize::from(segment[12] >> 4) * 4;
                if data_offset < TCP_HEADER_LEN || data_offset > segment.len() {
                    return Err(PacketError::Truncated {
                        layer: "TCP",
                        needed: data_offset.max(TCP_HEADER_LEN),
                        available: segment.len(),
                    });
                }
                data_offset
            }
            IpProtocol::Udp => {
                if segment.len() < UDP_HEADER_LEN {
                    return Err(PacketError::Truncated {
                        layer: "UDP",
                        needed: UDP_HEADER_LEN,
                        available: segment.len(),
                    });
                }
                UDP_HEADER_LEN
            }
        };

        let transport_start = header_len;
        let payload_start = header_len + transport_len;

        let ip = Ipv4Header {
            version,
            protocol,
            source,
            destination,
            header_len,
            raw: frame.slice(..header_len),
        };
        let transport = TransportHeader {
            protocol,
            source_port: u16::from_be_bytes([segment[0], segment[1]]),
            destination_port: u16::from_be_bytes([segment[2], segment[3]]),
            raw: frame.slice(transport_start..payload_start),
        };

        Ok(Self {
            ip,
            transport,
            payload: frame.slice(payload_start..end),
            headers: frame.slice(..payload_start),
        })
    }

    /// IPv4 header view
    #[must_use]
    pub fn ip(&self) -> &Ipv4Header {
        &self.ip
    }

    /// Transport header view
    #[must_use]
    pub fn transport(&self) -> &TransportHeader {
        &self.transport
    }

    /// Transport payload
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Original IP + transport header bytes, used as the reply template
    #[must_use]
    pub fn header_bytes(&self) -> &Bytes {
        &self.headers
    }

    /// Transport protocol
    #[must_use]
    pub fn protocol(&self) -> IpProtocol {
        self.ip.protocol
    }

    /// Source address and port
    #[must_use]
    pub fn source(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.source, self.transport.source_port)
    }

    /// Destination address and port
    #[must_use]
    pub fn destination(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip.destination, self.transport.destination_port)
    }
}

/// Parse the first `length` bytes of `buffer` as an IPv4 frame
///
/// The bytes are copied so the returned packet outlives the read buffer.
///
/// # Errors
///
/// Returns `PacketError::TooShort` when `length < 20`, `Truncated` when
/// `length` exceeds the buffer, and the errors of [`Packet::from_frame`].
pub fn parse(buffer: &[u8], length: usize) -> Result<Packet, PacketError> {
    if length < IPV4_MIN_HEADER_LEN {
        return Err(PacketError::TooShort { len: length });
    }
    let frame = buffer.get(..length).ok_or(PacketError::Truncated {
        layer: "frame",
        needed: length,
        available: buffer.len(),
    })?;
    Packet::from_frame(Bytes::copy_from_slice(frame))
}

/// Build a reply frame for the flow that `original` belongs to
///
/// Source and destination addresses and ports are swapped, the IPv4 total
/// length and header checksum are recomputed, and `payload` is appended.
///
/// # Errors
///
/// Returns `PacketError::PayloadTooLarge` when the frame would exceed the
/// 16-bit IPv4 total length.
pub fn build_reply(original: &Packet, payload: &[u8]) -> Result<Bytes, PacketError> {
    if payload.len() > MAX_REPLY_PAYLOAD {
        return Err(PacketError::PayloadTooLarge(payload.len()));
    }

    let protocol = original.protocol();
    let transport_len = match protocol {
        IpProtocol::Tcp => TCP_HEADER_LEN,
        IpProtocol::Udp => UDP_HEADER_LEN,
    };
    let total_len = IPV4_MIN_HEADER_LEN + transport_len + payload.len();

    let mut frame = BytesMut::with_capacity(total_len);

    // IPv4 header
    frame.put_u8(0x45); // version 4, IHL 5
    frame.put_u8(0); // DSCP/ECN
    frame.put_u16(total_len as u16);
    frame.put_u16(0); // identification
    frame.put_u16(IPV4_FLAG_DONT_FRAGMENT);
    frame.put_u8(REPLY_TTL);
    frame.put_u8(protocol.number());
    frame.put_u16(0); // checksum, filled below
    frame.put_slice(&original.ip.destination.octets());
    frame.put_slice(&original.ip.source.octets());
    fill_ipv4_checksum(&mut frame[..IPV4_MIN_HEADER_LEN]);

    // Transport header, ports swapped
    frame.put_u16(original.transport.destination_port);
    frame.put_u16(original.transport.source_port);
    match protocol {
        IpProtocol::Tcp => {
            frame.put_u32(0); // sequence
            frame.put_u32(0); // acknowledgment
            frame.put_u8((TCP_HEADER_LEN as u8 / 4) << 4);
            frame.put_u8(TCP_FLAGS_ACK_PSH);
            frame.put_u16(TCP_REPLY_WINDOW);
            frame.put_u16(0); // checksum
            frame.put_u16(0); // urgent pointer
        }
        IpProtocol::Udp => {
            frame.put_u16((UDP_HEADER_LEN + payload.len()) as u16);
            frame.put_u16(0); // no checksum
        }
    }

    frame.put_slice(payload);
    Ok(frame.freeze())
}
