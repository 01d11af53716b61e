//! Configuration file support for D2DP CLI tools

use d2dp::{Role, Security, SessionConfig};
use d2dp_protocol::params::{
    DEFAULT_ACK_PERIOD, DEFAULT_BUFFER_SIZE, DEFAULT_RTO_PERIOD, DESTROY_TIMEOUT, RETRY_LIMIT_MAX,
    RETRY_LIMIT_MIN,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Protocol tuning, mirrors [`SessionConfig`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub buffer_size: usize,
    pub ack_period_ms: u64,
    pub rto_period_ms: u64,
    pub retry_limit_min: u32,
    pub retry_limit_max: u32,
    pub flush_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            buffer_size: DEFAULT_BUFFER_SIZE,
            ack_period_ms: DEFAULT_ACK_PERIOD.as_millis() as u64,
            rto_period_ms: DEFAULT_RTO_PERIOD.as_millis() as u64,
            retry_limit_min: RETRY_LIMIT_MIN,
            retry_limit_max: RETRY_LIMIT_MAX,
            flush_timeout_ms: DESTROY_TIMEOUT.as_millis() as u64,
        }
    }
}

/// Encryption settings; no secret means plaintext
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoSection {
    /// Shared secret both ends derive their keys from
    pub secret: Option<String>,
    /// Rotate the transmit key after this many payload bytes
    pub rekey_bytes: Option<u64>,
}

/// Socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkSection {
    /// Local bind address
    pub local: SocketAddr,
    /// Peer address
    pub peer: Option<SocketAddr>,
    /// How long a socket read blocks before the receive thread re-checks
    /// for shutdown
    pub poll_interval_ms: u64,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

impl Default for LinkSection {
    fn default() -> Self {
        LinkSection {
            local: SocketAddr::from(([0, 0, 0, 0], 0)),
            peer: None,
            poll_interval_ms: d2dp_io::DEFAULT_POLL_INTERVAL.as_millis() as u64,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub session: SessionSection,
    pub crypto: CryptoSection,
    pub link: LinkSection,
}

impl CliConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: CliConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Load `path` if given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let s = &self.session;
        let config = SessionConfig::default()
            .with_buffer_size(s.buffer_size)
            .with_ack_period(Duration::from_millis(s.ack_period_ms))
            .with_rto_period(Duration::from_millis(s.rto_period_ms))
            .with_retry_limits(s.retry_limit_min, s.retry_limit_max)
            .with_flush_timeout(Duration::from_millis(s.flush_timeout_ms));
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    pub fn security(&self, role: Role) -> Result<Option<Security>, ConfigError> {
        match &self.crypto.secret {
            Some(secret) if secret.is_empty() => {
                Err(ConfigError::Invalid("crypto secret is empty".to_string()))
            }
            Some(secret) => Security::chacha20(secret.as_bytes(), role)
                .map(Some)
                .map_err(|e| ConfigError::Invalid(e.to_string())),
            None => Ok(None),
        }
    }

    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        if self.link.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(Duration::from_millis(self.link.poll_interval_ms))
    }

    /// Create example configuration
    pub fn example() -> Self {
        CliConfig {
            session: SessionSection::default(),
            crypto: CryptoSection {
                secret: Some("change me".to_string()),
                rekey_bytes: Some(64 * 1024 * 1024),
            },
            link: LinkSection {
                local: SocketAddr::from(([0, 0, 0, 0], 9000)),
                peer: Some(SocketAddr::from(([192, 168, 1, 10], 9000))),
                ..LinkSection::default()
            },
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
