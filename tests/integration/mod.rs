//! Integration tests for disguise-tunnel
//!
//! This module contains integration tests that exercise the tunnel core
//! over real loopback sockets and in-memory interfaces.
//!
//! # Test Organization
//!
//! - `support`: Mock SOCKS5 forwarder, mock secure channel, frame builders
//! - `transport_chain`: Disguise chains against mock front ends
//! - `flow_table`: Flow sessions through a real SOCKS5 forwarder
//! - `controller`: Session controller state sequences
//! - `service`: End-to-end frames through `TunnelService`
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests controller
//!
//! # Run tests that require a resolver (marked with #[ignore])
//! cargo test --test integration_tests -- --ignored
//! ```

pub mod controller;
pub mod flow_table;
pub mod support;
pub mod transport_chain;
