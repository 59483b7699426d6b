//! Failure classification for display
//!
//! Declared error kinds are checked first. Secure-channel libraries tend to
//! report everything as one opaque error type, so their message text is
//! matched as a fallback.

use std::fmt;
use std::io;

use crate::error::{ChannelError, SessionError, TunnelError};
use crate::transport::TransportError;

/// User-facing failure category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Name resolution failed
    HostNotFound,
    /// Connect, handshake or authentication took too long
    Timeout,
    /// Remote end refused the connection
    ConnectionRefused,
    /// Credentials rejected or authentication cancelled
    AuthenticationFailure,
    /// An established session ended
    SessionTerminated,
    /// Anything else
    Generic,
}

impl ErrorCategory {
    /// Stable kebab-case label
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HostNotFound => "host-not-found",
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection-refused",
            Self::AuthenticationFailure => "authentication-failure",
            Self::SessionTerminated => "session-terminated",
            Self::Generic => "generic",
        }
    }

    /// Short sentence for the UI
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::HostNotFound => "Server address could not be resolved",
            Self::Timeout => "Connection timed out",
            Self::ConnectionRefused => "Connection refused by the server",
            Self::AuthenticationFailure => "Authentication failed, check user name and password",
            Self::SessionTerminated => "Session terminated by the server",
            Self::Generic => "Connection failed",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a tunnel failure
#[must_use]
pub fn classify(err: &TunnelError) -> ErrorCategory {
    let declared = match err {
        TunnelError::Handshake(e) => classify_transport(e),
        TunnelError::Channel(e) => classify_channel(e),
        TunnelError::Session(e) => classify_session(e),
        TunnelError::Interface(e) => classify_io(e),
        TunnelError::Timeout { .. } => Some(ErrorCategory::Timeout),
        TunnelError::Config(_) | TunnelError::Packet(_) => None,
    };

    declared.unwrap_or_else(|| classify_message(&err.to_string()))
}

fn classify_transport(err: &TransportError) -> Option<ErrorCategory> {
    match err {
        TransportError::DnsResolutionFailed { .. } => Some(ErrorCategory::HostNotFound),
        TransportError::ConnectionRefused { .. } => Some(ErrorCategory::ConnectionRefused),
        TransportError::Timeout { .. } => Some(ErrorCategory::Timeout),
        TransportError::Socks5 { source, .. } if source.is_refused() => {
            Some(ErrorCategory::ConnectionRefused)
        }
        TransportError::Io(e) => classify_io(e),
        _ => None,
    }
}

fn classify_channel(err: &ChannelError) -> Option<ErrorCategory> {
    match err {
        ChannelError::Transport(e) => classify_transport(e),
        ChannelError::Authentication(_) => Some(ErrorCategory::AuthenticationFailure),
        ChannelError::Disconnected(_) => Some(ErrorCategory::SessionTerminated),
        ChannelError::Forwarding { .. } | ChannelError::Library(_) => None,
    }
}

fn classify_session(err: &SessionError) -> Option<ErrorCategory> {
    match err {
        SessionError::Io(e) => classify_io(e),
        SessionError::Proxy { source, .. } if source.is_refused() => {
            Some(ErrorCategory::ConnectionRefused)
        }
        _ => None,
    }
}

fn classify_io(err: &io::Error) -> Option<ErrorCategory> {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => Some(ErrorCategory::ConnectionRefused),
        io::ErrorKind::TimedOut => Some(ErrorCategory::Timeout),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(ErrorCategory::SessionTerminated),
        _ => None,
    }
}

/// Substring fallback on lowercase message text
#[must_use]
pub fn classify_message(message: &str) -> ErrorCategory {
    let message = message.to_lowercase();
    let has = |needle: &str| message.contains(needle);

    if has("auth fail") || has("auth cancel") || has("authentication failed") {
        ErrorCategory::AuthenticationFailure
    } else if has("session is down") {
        ErrorCategory::SessionTerminated
    } else if has("connection refused") {
        ErrorCategory::ConnectionRefused
    } else if has("timeout") || has("timed out") {
        ErrorCategory::Timeout
    } else if has("unknown host") || has("unknownhost") || has("not found") || has("failed to resolve") {
        ErrorCategory::HostNotFound
    } else {
        ErrorCategory::Generic
    }
}
