//! D2DP Protocol Core Implementation
//!
//! This crate implements the pieces of the D2DP transport that do not touch
//! sockets or threads: circular sequence arithmetic, the packet node arena,
//! the frame header codec and the send/receive windows.

pub mod arena;
pub mod header;
pub mod params;
pub mod rx_buffer;
pub mod tx_buffer;
pub mod wrap;

pub use arena::{Arena, ArenaError, NodeId, NodeState};
pub use header::{FrameHeader, FrameKind, HeaderError, SackPair, FLAG_ACK, FLAG_SUSPEND};
pub use rx_buffer::{RxBuffer, RxPut};
pub use tx_buffer::{PeekedNode, TxBuffer, TxBufferError};
pub use wrap::SeqId;
