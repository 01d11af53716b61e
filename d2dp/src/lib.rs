//! D2DP - Device-to-Device Protocol
//!
//! Reliable, ordered and optionally encrypted byte streams over connected
//! datagram sockets.
//!
//! ```no_run
//! use d2dp::{MemorySocket, RecvFlags, SendFlags, Session};
//!
//! let (a, b) = MemorySocket::pair();
//! let sender = Session::create(a, None)?;
//! let receiver = Session::create(b, None)?;
//!
//! sender.send(b"hello", SendFlags::NONE)?;
//! let mut buf = [0u8; 5];
//! receiver.recv(&mut buf, RecvFlags::WAITALL)?;
//!
//! sender.close()?;
//! receiver.close()?;
//! # Ok::<(), d2dp::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod options;
pub mod session;
pub mod stats;
mod transport;

pub use d2dp_crypto as crypto;
pub use d2dp_io as io;
pub use d2dp_protocol as protocol;

pub use config::{ConfigError, SessionConfig};
pub use d2dp_crypto::{Role, Security};
pub use d2dp_io::{DatagramSocket, MemorySocket, UdpLink};
pub use error::{Error, LinkError, Result};
pub use options::{OptionName, RecvFlags, SendFlags, SessionOption};
pub use session::{RxKeyGuard, Session, TxKeyGuard};
pub use stats::SessionStats;
pub use transport::SessionState;
