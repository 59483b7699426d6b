//! Configuration types for disguise-tunnel
//!
//! A configuration file holds one or more tunnel profiles, the selected
//! profile id, the session tunables and logging options. Profiles are passed
//! by value into the controller when a connection attempt starts.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Local port the secure channel's dynamic forwarding proxy listens on
pub const DEFAULT_FORWARDING_PORT: u16 = 10800;

/// Bound on the outbound connect and secure-channel handshake
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Smallest MTU that leaves room for reply headers
pub const MIN_MTU: u16 = 576;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Tunnel profiles
    pub profiles: Vec<TunnelConfig>,

    /// Id of the profile used by `start`
    pub active_profile: String,

    /// Session tunables
    #[serde(default)]
    pub tunables: TunnelTunables,

    /// Local dynamic forwarding port
    #[serde(default = "default_forwarding_port")]
    pub forwarding_port: u16,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Routing mark applied to tunnel-owned sockets (Linux/Android)
    #[serde(default)]
    pub socket_mark: Option<u32>,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.profiles.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one profile must be configured".into(),
            ));
        }

        let mut ids = std::collections::HashSet::new();
        for profile in &self.profiles {
            profile.validate()?;
            if !ids.insert(profile.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate profile id: {}",
                    profile.id
                )));
            }
        }

        if !ids.contains(self.active_profile.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Active profile '{}' not found in profiles list",
                self.active_profile
            )));
        }

        if self.forwarding_port == 0 {
            return Err(ConfigError::ValidationError(
                "forwarding_port must be greater than 0".into(),
            ));
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        self.tunables.validate()
    }

    /// The profile selected by `active_profile`
    #[must_use]
    pub fn active(&self) -> Option<&TunnelConfig> {
        self.profiles.iter().find(|p| p.id == self.active_profile)
    }

    /// Connect timeout as a `Duration`
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        let profile = TunnelConfig::new("default", "Direct SSH", "ssh.example.com", 22)
            .with_credentials("user", "");
        Self {
            active_profile: profile.id.clone(),
            profiles: vec![profile],
            tunables: TunnelTunables::default(),
            forwarding_port: DEFAULT_FORWARDING_PORT,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            socket_mark: None,
            log: LogConfig::default(),
        }
    }
}

/// Disguise variant selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    /// Plain TCP to the target
    #[default]
    Direct,
    /// TLS with optional SNI override
    Ssl,
    /// HTTP payload injection over plain TCP
    Payload,
    /// HTTP payload injection over TLS
    PayloadSsl,
    /// WebSocket framing over plain TCP
    Websocket,
    /// WebSocket framing over TLS
    WebsocketSsl,
    /// Upstream SOCKS5 proxy hop
    Socks5,
}

impl ConnectionType {
    /// Resolve the variant actually used for `payload`
    ///
    /// Payload and TLS profiles whose template asks for a WebSocket upgrade
    /// are carried over WebSocket framing instead.
    #[must_use]
    pub fn effective(self, payload: &str) -> Self {
        if !requests_websocket(payload) {
            return self;
        }
        match self {
            Self::Payload => Self::Websocket,
            Self::PayloadSsl | Self::Ssl => Self::WebsocketSsl,
            other => other,
        }
    }

    /// Whether the variant wraps the connection in TLS
    #[must_use]
    pub const fn uses_tls(self) -> bool {
        matches!(self, Self::Ssl | Self::PayloadSsl | Self::WebsocketSsl)
    }

    /// Whether the variant sends the payload template
    #[must_use]
    pub const fn uses_payload(self) -> bool {
        matches!(self, Self::Payload | Self::PayloadSsl)
    }

    /// Whether the variant frames traffic as WebSocket messages
    #[must_use]
    pub const fn uses_websocket(self) -> bool {
        matches!(self, Self::Websocket | Self::WebsocketSsl)
    }

    /// Default proxy port when the profile leaves it unset
    #[must_use]
    pub const fn default_proxy_port(self) -> u16 {
        match self {
            Self::Socks5 => 1080,
            Self::Ssl | Self::PayloadSsl | Self::WebsocketSsl => 443,
            Self::Direct | Self::Payload | Self::Websocket => 80,
        }
    }

    /// Config file name of the variant
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Ssl => "ssl",
            Self::Payload => "payload",
            Self::PayloadSsl => "payload_ssl",
            Self::Websocket => "websocket",
            Self::WebsocketSsl => "websocket_ssl",
            Self::Socks5 => "socks5",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when `payload` carries an `Upgrade: websocket` header
#[must_use]
pub fn requests_websocket(payload: &str) -> bool {
    payload
        .to_ascii_lowercase()
        .contains("upgrade: websocket")
}

/// One tunnel profile
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelConfig {
    /// Stable identifier
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Secure-channel server host
    pub ssh_host: String,

    /// Secure-channel server port
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Login user
    #[serde(default)]
    pub ssh_user: String,

    /// Login password
    #[serde(default)]
    pub ssh_password: String,

    /// Disguise variant
    #[serde(default)]
    pub connection_type: ConnectionType,

    /// Proxy host (empty for none)
    #[serde(default)]
    pub proxy_host: String,

    /// Proxy port; defaults per connection type
    #[serde(default)]
    pub proxy_port: Option<u16>,

    /// Payload template
    #[serde(default)]
    pub payload: String,

    /// SNI override (empty for none)
    #[serde(default)]
    pub sni: String,

    /// Verify the server certificate against the web PKI roots
    #[serde(default)]
    pub verify_certificate: bool,
}

impl TunnelConfig {
    /// Create a direct profile
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        ssh_host: impl Into<String>,
        ssh_port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ssh_host: ssh_host.into(),
            ssh_port,
            ssh_user: String::new(),
            ssh_password: String::new(),
            connection_type: ConnectionType::Direct,
            proxy_host: String::new(),
            proxy_port: None,
            payload: String::new(),
            sni: String::new(),
            verify_certificate: false,
        }
    }

    /// Set login credentials
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.ssh_user = user.into();
        self.ssh_password = password.into();
        self
    }

    /// Set the disguise variant
    #[must_use]
    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }

    /// Route through a proxy
    #[must_use]
    pub fn with_proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.proxy_host = host.into();
        self.proxy_port = Some(port);
        self
    }

    /// Set the payload template
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the SNI override
    #[must_use]
    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = sni.into();
        self
    }

    /// Whether a proxy host is configured
    #[must_use]
    pub fn has_proxy(&self) -> bool {
        !self.proxy_host.trim().is_empty()
    }

    /// Disguise variant after WebSocket promotion
    #[must_use]
    pub fn effective_connection_type(&self) -> ConnectionType {
        self.connection_type.effective(&self.payload)
    }

    /// Host and port the outbound connection dials
    #[must_use]
    pub fn dial_target(&self) -> (String, u16) {
        if self.has_proxy() {
            let kind = self.effective_connection_type();
            (
                self.proxy_host.trim().to_string(),
                self.proxy_port.unwrap_or_else(|| kind.default_proxy_port()),
            )
        } else {
            (self.ssh_host.clone(), self.ssh_port)
        }
    }

    /// SNI override, `None` when blank
    #[must_use]
    pub fn sni_override(&self) -> Option<&str> {
        let sni = self.sni.trim();
        (!sni.is_empty()).then_some(sni)
    }

    /// Validate the profile
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Profile id cannot be empty".into(),
            ));
        }

        if self.ssh_host.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Profile '{}': ssh_host cannot be empty",
                self.id
            )));
        }

        if self.ssh_port == 0 {
            return Err(ConfigError::ValidationError(format!(
                "Profile '{}': ssh_port must be greater than 0",
                self.id
            )));
        }

        if self.proxy_port == Some(0) {
            return Err(ConfigError::ValidationError(format!(
                "Profile '{}': proxy_port must be greater than 0",
                self.id
            )));
        }

        let kind = self.effective_connection_type();
        if kind == ConnectionType::Socks5 && !self.has_proxy() {
            return Err(ConfigError::ValidationError(format!(
                "Profile '{}': socks5 requires proxy_host",
                self.id
            )));
        }

        if kind.uses_payload() && self.payload.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "Profile '{}': {} requires a payload template",
                self.id, kind
            )));
        }

        Ok(())
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field("ssh_password", &"<redacted>")
            .field("connection_type", &self.connection_type)
            .field("proxy_host", &self.proxy_host)
            .field("proxy_port", &self.proxy_port)
            .field("payload_len", &self.payload.len())
            .field("sni", &self.sni)
            .field("verify_certificate", &self.verify_certificate)
            .finish()
    }
}

/// Per-session tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct TunnelTunables {
    /// Negotiate channel compression
    #[serde(default)]
    pub use_compression: bool,

    /// Disable Nagle's algorithm on the outbound socket
    #[serde(default = "default_true")]
    pub use_tcp_no_delay: bool,

    /// Send keepalives
    #[serde(default = "default_true")]
    pub use_keep_alive: bool,

    /// Reconnect after an unexpected loss
    #[serde(default)]
    pub use_auto_reconnect: bool,

    /// Virtual interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
}

impl TunnelTunables {
    /// Validate the tunables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when the MTU is too small.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mtu < MIN_MTU {
            return Err(ConfigError::ValidationError(format!(
                "mtu must be at least {MIN_MTU}, got {}",
                self.mtu
            )));
        }
        Ok(())
    }

    /// Largest proxy read converted into a single reply frame
    #[must_use]
    pub fn reply_chunk_size(&self) -> usize {
        usize::from(self.mtu).saturating_sub(40).max(1)
    }
}

impl Default for TunnelTunables {
    fn default() -> Self {
        Self {
            use_compression: false,
            use_tcp_no_delay: true,
            use_keep_alive: true,
            use_auto_reconnect: false,
            mtu: default_mtu(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_ssh_port() -> u16 {
    22
}

const fn default_mtu() -> u16 {
    1500
}

const fn default_forwarding_port() -> u16 {
    DEFAULT_FORWARDING_PORT
}

const fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}
