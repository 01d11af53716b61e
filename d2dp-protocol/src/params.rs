//! Protocol constants and tunable defaults

use std::time::Duration;

/// Maximum UDP datagram used by D2DP (Ethernet MTU 1500 - IP/UDP headers)
pub const DATAGRAM_SIZE: usize = 1472;

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 16;

/// Size of one serialized SACK pair
pub const SACK_PAIR_SIZE: usize = 8;

/// Maximum number of SACK pairs in one ACK frame
pub const MAX_SACK_PAIRS: usize = 100;

/// Largest payload of a DATA frame without encryption
pub const MAX_PAYLOAD_SIZE: usize = DATAGRAM_SIZE - HEADER_SIZE;

/// Protocol version carried in the upper nibble of the flags field
pub const PROTOCOL_VERSION: u8 = 1;

/// Default size of each window
pub const DEFAULT_BUFFER_SIZE: usize = 6 * 1024 * 1024;
pub const MIN_BUFFER_SIZE: usize = 4 * 1024;
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Period of the ACK timer
pub const DEFAULT_ACK_PERIOD: Duration = Duration::from_millis(5);
pub const MIN_ACK_PERIOD: Duration = Duration::from_millis(1);
pub const MAX_ACK_PERIOD: Duration = Duration::from_secs(100);

/// Period of the RTO timer (10x the ACK period)
pub const DEFAULT_RTO_PERIOD: Duration = Duration::from_millis(50);
pub const MIN_RTO_PERIOD: Duration = Duration::from_millis(10);
pub const MAX_RTO_PERIOD: Duration = Duration::from_secs(1000);

/// Consecutive RTO fires before the delay starts doubling
pub const RETRY_LIMIT_MIN: u32 = 8;

/// Consecutive RTO fires after which the link is declared dead
pub const RETRY_LIMIT_MAX: u32 = 16;

/// Receive window fill level above which the peer is asked to suspend
pub const ALLOWED_FILL_PERCENTAGE: usize = 90;

/// Upper bound for the flush performed on close
pub const DESTROY_TIMEOUT: Duration = Duration::from_secs(10);
