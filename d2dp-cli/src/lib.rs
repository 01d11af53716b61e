//! D2DP CLI Library
//!
//! Shared functionality for the D2DP command-line tools.

pub mod config;
pub mod framing;
pub mod link;
pub mod stats;

pub use config::{CliConfig, ConfigError, CryptoSection, LinkSection, SessionSection};
pub use framing::{read_message, write_message, FramingError, Message};
pub use link::{open_link, LinkSetupError};
pub use stats::{display_compact_stats, display_session_stats};
