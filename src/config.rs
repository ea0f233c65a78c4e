//! Server configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::{FRAME_HEADER_LEN, MAX_USERNAME_LEN, SEQ_LEN};

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:4242";

/// Default certificate subject the server presents.
pub const DEFAULT_SERVER_NAME: &str = "server";

/// Default directory holding keys and certificates.
pub const DEFAULT_KEY_DIR: &str = "certification";

/// Default mailbox poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Default time an initiator waits for a chat answer.
pub const DEFAULT_PROPOSAL_TIMEOUT_SECS: u64 = 60;

/// Default time a client has to complete the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Users provisioned when no roster is configured.
pub const DEFAULT_ROSTER: [&str; 4] = ["alice", "bob", "charlie", "dave"];

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for a chat server.
///
/// Every field has a default, so an empty TOML file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind_addr: String,

    /// Subject name in the server certificate.
    pub server_name: String,

    /// Fixed list of users; a user's id is its index here.
    pub roster: Vec<String>,

    /// Directory with `<name>_pubkey.pem` files and the CA key.
    pub key_dir: PathBuf,

    /// Base name of the server signing key inside `key_dir`.
    pub server_key: String,

    /// Path of the server certificate.
    pub server_cert: PathBuf,

    /// Mailbox poll interval in milliseconds.
    pub poll_interval_ms: u64,

    /// How long an initiator waits for the peer's answer.
    pub proposal_timeout_secs: u64,

    /// How long a client has to finish the handshake.
    pub handshake_timeout_secs: u64,

    /// Largest accepted sealed frame body.
    pub max_frame_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            roster: DEFAULT_ROSTER.iter().map(|s| s.to_string()).collect(),
            key_dir: PathBuf::from(DEFAULT_KEY_DIR),
            server_key: DEFAULT_SERVER_NAME.to_string(),
            server_cert: Path::new(DEFAULT_KEY_DIR).join("server_cert.pem"),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            proposal_timeout_secs: DEFAULT_PROPOSAL_TIMEOUT_SECS,
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
            max_frame_len: crate::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Checks roster names, intervals and frame limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.roster.is_empty() {
            return Err(ConfigError::Invalid("roster is empty".to_string()));
        }
        let mut seen = HashSet::new();
        for name in &self.roster {
            validate_username(name)?;
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate roster entry: {}",
                    name
                )));
            }
        }
        validate_username(&self.server_key)?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be > 0".to_string()));
        }
        if self.proposal_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }
        // Room for a sequence number and at least an opcode.
        if self.max_frame_len < SEQ_LEN + 1 {
            return Err(ConfigError::Invalid(format!(
                "max_frame_len must be at least {}",
                SEQ_LEN + 1
            )));
        }
        if self.max_frame_len > u32::MAX as usize - FRAME_HEADER_LEN {
            return Err(ConfigError::Invalid("max_frame_len too large".to_string()));
        }
        Ok(())
    }

    /// Mailbox poll period.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Proposal answer deadline.
    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_secs(self.proposal_timeout_secs)
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Roster names double as key file names, so only ASCII alphanumerics pass.
pub fn validate_username(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name.len() > MAX_USERNAME_LEN {
        return Err(ConfigError::Invalid(format!(
            "username length must be 1..={}: {:?}",
            MAX_USERNAME_LEN, name
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConfigError::Invalid(format!(
            "username must be alphanumeric: {:?}",
            name
        )));
    }
    Ok(())
}
