//! Configuration module for disguise-tunnel
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use disguise_tunnel::config::load_config;
//!
//! let config = load_config("/etc/disguise-tunnel/config.json").unwrap();
//! println!("Active profile: {}", config.active_profile);
//! ```

mod loader;
mod types;

pub use loader::{
    create_default_config, load_config, load_config_str, load_config_with_env, ENV_LOG_LEVEL,
    ENV_PROFILE,
};
pub use types::{
    requests_websocket, AppConfig, ConnectionType, LogConfig, TunnelConfig, TunnelTunables,
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_FORWARDING_PORT, MIN_MTU,
};
