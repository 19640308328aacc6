//! Error taxonomy for channels, transports, and capability registration.

use std::io;

use thiserror::Error;

/// Why an [`invoke`](crate::Channel::invoke) did not produce a value.
///
/// Every variant is local to the call that produced it, except
/// [`CallError::ChannelClosed`], which is delivered to every call pending at
/// the moment the channel closes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The peer never advertised `name` (or has no such capability).
    #[error("unsupported method: {name}")]
    UnsupportedMethod { name: String },

    /// The peer's handshake did not arrive in time; the channel is degraded.
    #[error("peer handshake timed out")]
    HandshakeTimeout,

    /// No terminal message arrived before the per-call deadline.
    #[error("call {call_id} to {name} timed out")]
    CallTimeout { call_id: String, name: String },

    /// The transport was torn down or the channel was closed locally.
    #[error("channel closed")]
    ChannelClosed,

    /// The remote capability threw or rejected.
    #[error("{message}")]
    Remote {
        message: String,
        stack: Option<String>,
    },
}

/// Errors raised while moving envelopes over a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
}

/// Errors raised while building a [`CapabilityTable`](crate::CapabilityTable).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("`{name}` is not declared by interface `{interface}`")]
    Undeclared { interface: String, name: String },

    #[error("`{name}` is already registered")]
    Duplicate { name: String },

    #[error("interface `{interface}` is missing handlers for: {}", .names.join(", "))]
    Missing {
        interface: String,
        names: Vec<String>,
    },
}

/// Errors raised while loading a [`ChannelConfig`](crate::ChannelConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    #[cfg(feature = "toml-config")]
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}
