//! Configuration management

use crate::crypto::{make_obfuscator, EncryptionMethod, KEY_LEN};
use crate::mux::{SessionConfig, Valve, DEFAULT_MAX_FRAME_SIZE, DEFAULT_PAYLOAD_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Session engine configuration
    pub session: SessionSettings,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| settings_error(path, &e))?;
        toml::from_str(&content).map_err(|e| settings_error(path, &e))
    }

    /// Write the settings back out as pretty-printed TOML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).map_err(|e| settings_error(path, &e))?;
        std::fs::write(path, content).map_err(|e| settings_error(path, &e))
    }
}

/// One error shape for every way a settings file can fail
fn settings_error(path: &Path, err: &dyn std::fmt::Display) -> crate::Error {
    crate::Error::Config(format!("settings file {}: {}", path.display(), err))
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Session engine configuration, as written in the config file
///
/// The negotiated session key is not part of the file; it comes from the
/// handshake and is combined with these settings at session setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Cipher suite: "plain", "aes-256-gcm" or "chacha20-poly1305"
    pub cipher: String,
    /// Deliver payloads in arrival order (message-oriented overlays)
    #[serde(default)]
    pub unordered: bool,
    /// Close idle sessions after this many seconds (0 = disabled)
    #[serde(default)]
    pub inactivity_timeout_secs: u64,
    /// Maximum frame payload carried on the wire
    #[serde(default = "default_payload_limit")]
    pub msg_on_wire_size_limit: usize,
    /// Hard upper bound on any received record
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Optional byte-rate limits
    pub valve: Option<ValveSettings>,
}

fn default_payload_limit() -> usize {
    DEFAULT_PAYLOAD_LIMIT
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            cipher: "chacha20-poly1305".to_string(),
            unordered: false,
            inactivity_timeout_secs: 0,
            msg_on_wire_size_limit: DEFAULT_PAYLOAD_LIMIT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            valve: None,
        }
    }
}

impl SessionSettings {
    /// Build the runtime session configuration for a negotiated session key
    pub fn session_config(&self, session_key: [u8; KEY_LEN]) -> Result<SessionConfig, crate::Error> {
        let method = EncryptionMethod::from_name(&self.cipher)
            .ok_or_else(|| crate::Error::Config(format!("unknown cipher: {}", self.cipher)))?;
        let obfuscator = make_obfuscator(method, session_key)?;

        let mut config = SessionConfig::new(obfuscator)
            .with_unordered(self.unordered)
            .with_payload_limit(self.msg_on_wire_size_limit)
            .with_max_frame_size(self.max_frame_size);

        if self.inactivity_timeout_secs > 0 {
            config =
                config.with_inactivity_timeout(Duration::from_secs(self.inactivity_timeout_secs));
        }
        if let Some(valve) = &self.valve {
            config = config.with_valve(Arc::new(Valve::new(
                valve.send_bytes_per_sec,
                valve.recv_bytes_per_sec,
            )));
        }
        Ok(config)
    }
}

/// Token-bucket limits in bytes per second; absent or zero means unlimited
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveSettings {
    pub send_bytes_per_sec: Option<u64>,
    pub recv_bytes_per_sec: Option<u64>,
}

/// Logging configuration
///
/// The engine logs through `tracing` and installs no subscriber of its
/// own; hosts fold [`LoggingConfig::directive`] into whatever filter
/// their subscriber uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Verbosity for this crate's targets: trace, debug, info, warn or error
    pub level: String,
}

impl LoggingConfig {
    /// Filter directive scoping `level` to this crate's log targets
    pub fn directive(&self) -> String {
        format!("{}={}", env!("CARGO_PKG_NAME"), self.level)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
