//! disguise-tunnel: packet-to-session engine for mobile SSH tunneling
//!
//! This crate is the core of a device-wide tunneling client. It reads raw
//! IPv4 frames from a virtual network interface, maps each TCP flow to a
//! connection through a local SOCKS proxy exposed by an authenticated
//! secure channel, and writes the replies back as IPv4 frames. The secure
//! channel itself reaches its server through a configurable stack of
//! disguise layers.
//!
//! # Features
//!
//! - **Packet Codec**: IPv4 + TCP/UDP header parsing and reply framing
//! - **Flow Sessions**: one proxy connection per flow, created on demand
//! - **Disguise Chain**: direct, TLS with SNI override, HTTP payload
//!   injection, WebSocket framing, upstream SOCKS5
//! - **Session Controller**: connect, forward, reconnect with backoff
//! - **Notifications**: state, readiness and log events for the UI
//!
//! # Architecture
//!
//! ```text
//! virtual interface -> engine -> packet::parse -> FlowTable
//!                                                   |
//!                          SOCKS5 CONNECT <---------+
//!                               |
//!                     loopback forwarding port
//!                               |
//!                        SecureChannel <- TunnelController
//!                               |
//!                  WebSocket/Payload -> TLS -> SOCKS5 -> TCP -> server
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use disguise_tunnel::channel::SecureChannelFactory;
//! use disguise_tunnel::config::load_config;
//! use disguise_tunnel::controller::ControllerSettings;
//! use disguise_tunnel::protect::default_protector;
//! use disguise_tunnel::service::TunnelService;
//!
//! # async fn example(
//! #     factory: Arc<dyn SecureChannelFactory>,
//! #     device: tokio::io::DuplexStream,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/data/tunnel/config.json")?;
//! let profile = config.active().cloned().ok_or("no active profile")?;
//!
//! let service = TunnelService::new(
//!     factory,
//!     default_protector(),
//!     ControllerSettings::from_config(&config),
//! );
//! service.start(profile, config.tunables, device);
//!
//! // ... later
//! service.stop("user requested").await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`packet`]: IPv4 frame parsing and reply serialization
//! - [`flow`]: Flow session table and interface writer
//! - [`transport`]: Disguise chain connectors
//! - [`controller`]: Tunnel session controller and state context
//! - [`classify`]: User-facing error categories
//! - [`bridge`]: Notification events and sinks
//! - [`service`]: Start/stop surface wiring everything together

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bridge;
pub mod channel;
pub mod classify;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod flow;
pub mod packet;
pub mod protect;
pub mod service;
pub mod socks5;
pub mod transport;

// Re-export commonly used types at the crate root
pub use bridge::{BroadcastSink, LogLevel, NotificationSink, SharedSink, TracingSink, TunnelEvent};
pub use channel::{ConnectRequest, SecureChannel, SecureChannelFactory};
pub use classify::{classify, ErrorCategory};
pub use config::{AppConfig, ConnectionType, TunnelConfig, TunnelTunables};
pub use controller::{ConnectionState, ControllerSettings, StateContext, TunnelController};
pub use error::{ChannelError, ConfigError, SessionError, TunnelError};
pub use flow::{FlowKey, FlowTable, InterfaceWriter};
pub use packet::{build_reply, parse, Packet, PacketError};
pub use service::TunnelService;
pub use transport::{build_chain, Connector, TransportError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
