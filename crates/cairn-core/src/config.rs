//! Configuration for cairn nodes.
//!
//! Resolution order: environment variables, then config file, then defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::{ACK_FIXED_SIZE, DATA_HEADER_SIZE, META_FIXED_SIZE};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CairnConfig {
    pub protocol: ProtocolConfig,
}

/// Protocol constants. Both peers of a pair must run identical values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Total datagram length. Every packet is padded to exactly this size.
    pub max_packet_size: usize,
    /// Maximum payload of one DATA_TRANSFER chunk.
    pub data_size: usize,
    /// First sequence number of every chunk stream.
    pub init_seq_number: u16,
    /// In-flight chunks a transfer may keep unacknowledged.
    pub send_window: u32,
    /// Ack-less retransmission rounds before the peer is latched dead.
    pub retry_limit: u32,
    /// Directory rescan interval in seconds.
    pub scan_interval_secs: u64,
    /// Sender tick interval in milliseconds.
    pub send_interval_ms: u64,
    /// Per-chunk wait for acknowledgments in milliseconds.
    pub estimated_rtt_ms: u64,
    /// Shared HMAC secret. Deployments must override this.
    pub key: String,
}

impl Default for CairnConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1500,
            data_size: 1400,
            init_seq_number: 0,
            send_window: 64,
            retry_limit: 3,
            scan_interval_secs: 5,
            send_interval_ms: 1000,
            estimated_rtt_ms: 50,
            key: "cairn-shared-key".to_owned(),
        }
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("cairn")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ──────────────────────────────────────────────────────────────────

impl CairnConfig {
    /// Load config: env vars, then file, then defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            CairnConfig::default()
        };
        config.apply_env_overrides();
        config.protocol.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CairnConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_PROTOCOL__KEY") {
            self.protocol.key = v;
        }
        if let Ok(v) = std::env::var("CAIRN_PROTOCOL__MAX_PACKET_SIZE") {
            if let Ok(n) = v.parse() {
                self.protocol.max_packet_size = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_PROTOCOL__DATA_SIZE") {
            if let Ok(n) = v.parse() {
                self.protocol.data_size = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_PROTOCOL__SCAN_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.protocol.scan_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_PROTOCOL__SEND_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                self.protocol.send_interval_ms = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_PROTOCOL__ESTIMATED_RTT_MS") {
            if let Ok(n) = v.parse() {
                self.protocol.estimated_rtt_ms = n;
            }
        }
    }
}

impl ProtocolConfig {
    /// Reject size combinations that cannot frame a packet.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_packet_size < (META_FIXED_SIZE + 1).max(ACK_FIXED_SIZE) {
            return Err(ConfigError::Invalid(format!(
                "max_packet_size {} cannot hold a control packet",
                self.max_packet_size
            )));
        }
        if self.data_size == 0 {
            return Err(ConfigError::Invalid("data_size must be non-zero".into()));
        }
        if self.data_size + DATA_HEADER_SIZE > self.max_packet_size {
            return Err(ConfigError::Invalid(format!(
                "data_size {} does not fit a {} byte packet",
                self.data_size, self.max_packet_size
            )));
        }
        if self.send_window == 0 {
            return Err(ConfigError::Invalid("send_window must be non-zero".into()));
        }
        if self.key.is_empty() {
            return Err(ConfigError::Invalid("key must not be empty".into()));
        }
        Ok(())
    }
}
