//! Channel configuration.
//!
//! A [`ChannelConfig`] can be built in code, parsed from TOML, and then
//! adjusted through `FRAME_BRIDGE_*` environment variables:
//!
//! ```toml
//! handshake_timeout_ms = 5000
//! call_timeout_ms = 15000
//! path = "/tools/editor"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1_048_576; // 64 MiB

pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "FRAME_BRIDGE_HANDSHAKE_TIMEOUT_MS";
pub const ENV_CALL_TIMEOUT_MS: &str = "FRAME_BRIDGE_CALL_TIMEOUT_MS";
pub const ENV_PATH: &str = "FRAME_BRIDGE_PATH";
pub const ENV_MAX_FRAME_LEN: &str = "FRAME_BRIDGE_MAX_FRAME_LEN";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// How long to wait for the peer's handshake before degrading.
    pub handshake_timeout_ms: u64,
    /// Per-call deadline, measured from `invoke`.
    pub call_timeout_ms: u64,
    /// Advertised as `path` in our handshake.
    pub path: Option<String>,
    /// Frame cap for the stream transport.
    pub max_frame_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            path: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ChannelConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = duration_ms(timeout);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Parse a TOML document; missing keys keep their defaults.
    #[cfg(feature = "toml-config")]
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    #[cfg(feature = "toml-config")]
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Apply `FRAME_BRIDGE_*` overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(ms) = env_parse::<u64>(ENV_HANDSHAKE_TIMEOUT_MS)? {
            self.handshake_timeout_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>(ENV_CALL_TIMEOUT_MS)? {
            self.call_timeout_ms = ms;
        }
        if let Some(len) = env_parse::<usize>(ENV_MAX_FRAME_LEN)? {
            self.max_frame_len = len;
        }
        if let Ok(path) = std::env::var(ENV_PATH) {
            self.path = if path.is_empty() { None } else { Some(path) };
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "handshake_timeout_ms",
            });
        }
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                field: "call_timeout_ms",
            });
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::Zero {
                field: "max_frame_len",
            });
        }
        Ok(())
    }
}

/// Whole milliseconds, rounded up so a non-zero duration never becomes 0.
fn duration_ms(d: Duration) -> u64 {
    let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
    u64::try_from(ms).unwrap_or(u64::MAX)
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value: raw }),
        Err(_) => Ok(None),
    }
}
