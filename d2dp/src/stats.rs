//! Session counters

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a session's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Packet id of the last transmitted frame
    pub tx_packet_id: u64,
    /// Packet id of the last accepted frame
    pub rx_packet_id: u64,
    pub data_sent: u64,
    pub acks_sent: u64,
    pub data_received: u64,
    pub acks_received: u64,
    /// Frames dropped as malformed, replayed or undecryptable
    pub dropped: u64,
    /// Acknowledgements sent early because of duplicates or decrypt failures
    pub forced_acks: u64,
    /// Retransmission timeouts
    pub rto_fires: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub tx_packet_id: AtomicU64,
    pub rx_packet_id: AtomicU64,
    pub data_sent: AtomicU64,
    pub acks_sent: AtomicU64,
    pub data_received: AtomicU64,
    pub acks_received: AtomicU64,
    pub dropped: AtomicU64,
    pub forced_acks: AtomicU64,
    pub rto_fires: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    /// Allocate the packet id for the next outgoing frame
    pub fn next_tx_packet_id(&self) -> u64 {
        self.tx_packet_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> SessionStats {
        SessionStats {
            tx_packet_id: self.tx_packet_id.load(Ordering::Relaxed),
            rx_packet_id: self.rx_packet_id.load(Ordering::Relaxed),
            data_sent: self.data_sent.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            data_received: self.data_received.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            forced_acks: self.forced_acks.load(Ordering::Relaxed),
            rto_fires: self.rto_fires.load(Ordering::Relaxed),
        }
    }
}
