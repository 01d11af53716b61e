//! Call flags and session options

use crate::error::{Error, Result};
use std::ops::BitOr;
use std::time::Duration;

/// Flags accepted by `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags(u32);

impl SendFlags {
    pub const NONE: SendFlags = SendFlags(0);
    /// The message is the last one sealed under the current transmit key
    pub const KEY_UPDATE: SendFlags = SendFlags(0x1);

    pub fn contains(self, other: SendFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for SendFlags {
    type Output = SendFlags;

    fn bitor(self, rhs: SendFlags) -> SendFlags {
        SendFlags(self.0 | rhs.0)
    }
}

/// Flags accepted by `recv`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecvFlags(u32);

impl RecvFlags {
    pub const NONE: RecvFlags = RecvFlags(0);
    /// Block until the whole buffer can be filled
    pub const WAITALL: RecvFlags = RecvFlags(0x1);

    pub fn contains(self, other: RecvFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for RecvFlags {
    type Output = RecvFlags;

    fn bitor(self, rhs: RecvFlags) -> RecvFlags {
        RecvFlags(self.0 | rhs.0)
    }
}

/// Option names for `get_option`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionName {
    RecvTimeout,
    TxCpuMask,
}

/// Option values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOption {
    /// Receive timeout in milliseconds, 0 blocks forever
    RecvTimeout(i32),
    /// CPU affinity mask requested for the transmit thread
    TxCpuMask(u64),
}

/// Current option values of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Options {
    pub recv_timeout: Option<Duration>,
    pub tx_cpu_mask: u64,
}

impl Options {
    pub fn set(&mut self, option: SessionOption) -> Result<()> {
        match option {
            SessionOption::RecvTimeout(ms) if ms < 0 => return Err(Error::InvalidOption),
            SessionOption::RecvTimeout(0) => self.recv_timeout = None,
            SessionOption::RecvTimeout(ms) => {
                self.recv_timeout = Some(Duration::from_millis(ms as u64))
            }
            SessionOption::TxCpuMask(mask) => {
                tracing::debug!(mask = format_args!("{:#x}", mask), "tx cpu mask requested");
                self.tx_cpu_mask = mask;
            }
        }
        Ok(())
    }

    pub fn get(&self, name: OptionName) -> SessionOption {
        match name {
            OptionName::RecvTimeout => {
                let ms = self
                    .recv_timeout
                    .map_or(0, |t| t.as_millis().min(i32::MAX as u128) as i32);
                SessionOption::RecvTimeout(ms)
            }
            OptionName::TxCpuMask => SessionOption::TxCpuMask(self.tx_cpu_mask),
        }
    }
}
