//! Session errors

use crate::config::ConfigError;
use std::io;
use thiserror::Error;

/// Reason a link failed for good
///
/// Recorded once per session; every blocked and future caller sees it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    #[error("Peer stopped acknowledging: retry limit exceeded")]
    RetryLimit,

    #[error("Socket error: {0}")]
    Socket(io::ErrorKind),

    #[error("Peer sent a malformed packet")]
    BadPacket,

    #[error("Transport thread interrupted")]
    Interrupted,

    #[error("Encryption failed")]
    Crypto,

    #[error("Internal window state corrupted")]
    Internal,
}

/// Errors returned by session operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Request of {requested} bytes exceeds the window of {capacity} bytes")]
    InvalidSize { requested: usize, capacity: usize },

    #[error("Invalid option value")]
    InvalidOption,

    #[error("Link failed: {0}")]
    Protocol(#[from] LinkError),

    #[error("Session is closed")]
    Closed,

    #[error("Operation interrupted")]
    Interrupted,

    #[error("Operation timed out")]
    TimedOut,

    #[error("A key update is already pending")]
    KeyUpdatePending,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Flush did not complete before close")]
    FlushTimedOut,

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Config(_) | Error::InvalidSize { .. } | Error::InvalidOption => {
                io::ErrorKind::InvalidInput
            }
            Error::Protocol(LinkError::Socket(kind)) => *kind,
            Error::Protocol(_) | Error::FlushTimedOut => io::ErrorKind::Other,
            Error::Closed => io::ErrorKind::NotConnected,
            Error::Interrupted => io::ErrorKind::Interrupted,
            Error::TimedOut => io::ErrorKind::TimedOut,
            Error::KeyUpdatePending => io::ErrorKind::WouldBlock,
            Error::OutOfMemory => io::ErrorKind::OutOfMemory,
            Error::Spawn { source, .. } => source.kind(),
        };
        io::Error::new(kind, err)
    }
}
