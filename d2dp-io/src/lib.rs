//! D2DP I/O and Platform Abstraction
//!
//! This crate provides the host primitives the protocol runs on: the
//! datagram socket contract with UDP and in-memory implementations, and the
//! periodic timers that drive acknowledgements and retransmissions.

pub mod socket;
pub mod timer;

pub use socket::{DatagramSocket, MemorySocket, SocketError, UdpLink, DEFAULT_POLL_INTERVAL};
pub use timer::{Timer, TimerTask};
