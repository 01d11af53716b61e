//! Send window
//!
//! Outbound stream bytes are stored in arena nodes ordered by sequence id.
//! Every node walks through a small state machine:
//!
//! ```text
//!   Unsent ──peek──> Sending ──return──> Sent
//!     │                 │                  │
//!     │                ack                 └──rto/sack gap──> NeedResend ──peek──> Sending
//!     │                 v
//!     │            Acknowledged ──return──> freed
//!     └──ack──> freed
//! ```
//!
//! A node in `Sending` state is owned by the transmitter, which copies it
//! into a frame and writes it to the socket without holding the window lock.
//! Acknowledgements arriving in that window only tag the node; it is freed
//! when the transmitter hands it back.

use crate::arena::{Arena, ArenaError, NodeId, NodeState};
use crate::header::SackPair;
use crate::wrap::SeqId;
use thiserror::Error;

/// Send window errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxBufferError {
    #[error("Send window is out of nodes")]
    OutOfMemory,

    #[error("Node {seq_id} returned after send in state {state:?}")]
    BadReturnState { seq_id: SeqId, state: NodeState },
}

/// Handle of a node handed out by [`TxBuffer::peek_next`]
#[derive(Debug)]
pub struct PeekedNode {
    id: NodeId,
    seq_id: SeqId,
    len: usize,
}

impl PeekedNode {
    /// Sequence id of the first payload byte
    pub fn seq_id(&self) -> SeqId {
        self.seq_id
    }

    /// Payload length
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[inline]
fn peeked(state: NodeState) -> bool {
    matches!(state, NodeState::Sending | NodeState::Acknowledged)
}

#[inline]
fn sendable(state: NodeState) -> bool {
    matches!(state, NodeState::Unsent | NodeState::NeedResend)
}

/// Outbound packet queue with retransmission state
pub struct TxBuffer {
    arena: Arena,
    /// Sequence id stamped on the next appended byte
    next_seq_id: SeqId,
    /// First node eligible for transmission
    cursor: Option<NodeId>,
    /// Peer asked to suspend new data
    flow_control: bool,
}

impl TxBuffer {
    /// Create a send window of `buffer_bytes` split into `elem_size` nodes
    pub fn new(buffer_bytes: usize, elem_size: usize) -> Result<Self, ArenaError> {
        Self::with_start(buffer_bytes, elem_size, SeqId::new(0))
    }

    /// Create a send window whose stream starts at `start`
    pub fn with_start(
        buffer_bytes: usize,
        elem_size: usize,
        start: SeqId,
    ) -> Result<Self, ArenaError> {
        Ok(TxBuffer {
            arena: Arena::new(buffer_bytes, elem_size)?,
            next_seq_id: start,
            cursor: None,
            flow_control: false,
        })
    }

    /// Total capacity in bytes
    pub fn size(&self) -> usize {
        self.arena.total_bytes()
    }

    /// Payload capacity of a node
    pub fn elem_size(&self) -> usize {
        self.arena.elem_size()
    }

    /// Number of nodes in the window
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Sequence id of the next byte to be appended
    pub fn next_seq_id(&self) -> SeqId {
        self.next_seq_id
    }

    /// Sequence id right after the last stored byte
    pub fn last_seq_id(&self) -> Option<SeqId> {
        self.arena.last().map(|id| self.arena.node(id).end())
    }

    pub fn flow_control(&self) -> bool {
        self.flow_control
    }

    pub fn set_flow_control(&mut self, enabled: bool) {
        self.flow_control = enabled;
    }

    fn writeable_tail(&self) -> Option<NodeId> {
        let id = self.arena.last()?;
        let node = self.arena.node(id);
        (node.state == NodeState::Unsent && node.len < self.arena.elem_size()).then_some(id)
    }

    /// Bytes that can be appended without blocking
    pub fn free_bytes(&self) -> usize {
        let tail = self
            .writeable_tail()
            .map_or(0, |id| self.arena.elem_size() - self.arena.node(id).len);
        tail + self.arena.free_nodes() * self.arena.elem_size()
    }

    /// Append `to_append` bytes taken from `bufs` in order
    ///
    /// The last node is topped up first, then fresh nodes are taken from the
    /// arena. Either all bytes are stored or, when the arena cannot hold
    /// them, nothing changes.
    pub fn append(&mut self, bufs: &[&[u8]], to_append: usize) -> Result<usize, TxBufferError> {
        let available: usize = bufs.iter().map(|b| b.len()).sum();
        let to_append = to_append.min(available);
        if to_append == 0 {
            return Ok(0);
        }

        let elem_size = self.arena.elem_size();
        let mut tail = self.writeable_tail();
        let tail_free = tail.map_or(0, |id| elem_size - self.arena.node(id).len);
        let nodes_needed = to_append.saturating_sub(tail_free).div_ceil(elem_size);
        if nodes_needed > self.arena.free_nodes() {
            return Err(TxBufferError::OutOfMemory);
        }

        let mut total = 0usize;
        let mut first_filled = None;
        for buf in bufs {
            let mut data = &buf[..buf.len().min(to_append - total)];
            while !data.is_empty() {
                let id = match tail {
                    Some(id) => id,
                    None => {
                        let id = self
                            .arena
                            .alloc(NodeState::Unsent)
                            .ok_or(TxBufferError::OutOfMemory)?;
                        self.arena.node_mut(id).seq_id = self.next_seq_id + total as u32;
                        self.arena.push_back(id);
                        id
                    }
                };
                first_filled.get_or_insert(id);

                let (node, storage) = self.arena.split_mut(id);
                let n = data.len().min(elem_size - node.len);
                storage[node.len..node.len + n].copy_from_slice(&data[..n]);
                node.len += n;
                data = &data[n..];
                total += n;

                tail = (node.len < elem_size).then_some(id);
            }
            if total == to_append {
                break;
            }
        }

        if self.cursor.is_none() {
            self.cursor = first_filled;
        }
        self.next_seq_id += total as u32;

        tracing::trace!(
            bytes = total,
            nodes = self.arena.len(),
            next_seq = %self.next_seq_id,
            "tx append"
        );

        Ok(total)
    }

    /// Whether a node can be transmitted now
    ///
    /// While flow controlled only retransmissions are allowed.
    pub fn has_sendable(&self) -> bool {
        match self.cursor {
            None => false,
            Some(id) => !self.flow_control || self.arena.node(id).state == NodeState::NeedResend,
        }
    }

    /// Hand out the first sendable node
    ///
    /// The payload is copied into `out` (which must hold at least one node),
    /// the node is tagged `Sending` and the cursor moves on. The caller must
    /// give the node back with [`TxBuffer::return_after_send`].
    pub fn peek_next(&mut self, out: &mut [u8]) -> Option<PeekedNode> {
        if !self.has_sendable() {
            return None;
        }
        let id = self.cursor?;

        let data = self.arena.data(id);
        let len = data.len();
        debug_assert!(out.len() >= len);
        out[..len].copy_from_slice(data);

        let node = self.arena.node_mut(id);
        node.state = NodeState::Sending;
        let seq_id = node.seq_id;

        self.cursor = self.next_sendable_after(id);

        Some(PeekedNode { id, seq_id, len })
    }

    fn next_sendable_after(&self, id: NodeId) -> Option<NodeId> {
        let mut it = self.arena.next(id);
        while let Some(next) = it {
            if sendable(self.arena.node(next).state) {
                return Some(next);
            }
            it = self.arena.next(next);
        }
        None
    }

    fn rewind_cursor(&mut self) {
        self.cursor = self
            .arena
            .iter()
            .find(|&id| sendable(self.arena.node(id).state));
    }

    /// Reconcile a node after its frame was written
    ///
    /// Returns `true` when the node now waits for an acknowledgement and
    /// `false` when an ACK arrived during the send and the node was freed.
    pub fn return_after_send(&mut self, peeked: PeekedNode) -> Result<bool, TxBufferError> {
        let id = peeked.id;
        let node = self.arena.node_mut(id);
        match node.state {
            NodeState::Sending => {
                node.state = NodeState::Sent;
                Ok(true)
            }
            NodeState::Acknowledged => {
                self.arena.remove(id);
                if self.cursor == Some(id) {
                    self.rewind_cursor();
                }
                Ok(false)
            }
            state => {
                tracing::error!(seq = %node.seq_id, ?state, "bad tx node state after send");
                Err(TxBufferError::BadReturnState {
                    seq_id: node.seq_id,
                    state,
                })
            }
        }
    }

    /// Schedule every outstanding node for retransmission
    ///
    /// Nodes owned by the transmitter are left alone; they will be resent by
    /// a later timeout if still unacknowledged.
    pub fn mark_need_resend_all(&mut self) {
        let mut it = self.arena.first();
        while let Some(id) = it {
            it = self.arena.next(id);
            let node = self.arena.node_mut(id);
            // the tail of the list consists of unsent nodes only
            if node.state == NodeState::Unsent {
                break;
            }
            if peeked(node.state) {
                continue;
            }
            node.state = NodeState::NeedResend;
        }
        self.rewind_cursor();
    }

    /// Acknowledge one node; returns whether it counts as freed
    fn acknowledge(&mut self, id: NodeId) -> bool {
        let node = self.arena.node_mut(id);
        match node.state {
            NodeState::Sending => {
                node.state = NodeState::Acknowledged;
                true
            }
            NodeState::Acknowledged => false,
            _ => {
                self.arena.remove(id);
                if self.cursor == Some(id) {
                    self.cursor = None;
                }
                true
            }
        }
    }

    fn free_ack(&mut self, ack_id: SeqId) -> usize {
        let mut freed = 0;
        let mut it = self.arena.first();
        while let Some(id) = it {
            it = self.arena.next(id);
            if self.arena.node(id).seq_id.ge(ack_id) {
                break;
            }
            freed += self.acknowledge(id) as usize;
        }
        freed
    }

    fn free_sack(&mut self, sacks: &[SackPair]) -> usize {
        let mut freed = 0;
        let mut pair_num = 0;
        let mut it = self.arena.first();

        while let Some(id) = it {
            let Some(pair) = sacks.get(pair_num) else {
                break;
            };
            let node = self.arena.node(id);
            let (seq_id, end, state) = (node.seq_id, node.end(), node.state);

            if seq_id.lt(pair.left) {
                // hole reported by the receiver
                if !peeked(state) {
                    self.arena.node_mut(id).state = NodeState::NeedResend;
                }
                it = self.arena.next(id);
                continue;
            }

            if seq_id.le(pair.right) {
                if end.gt(pair.right) {
                    pair_num += 1;
                }
                it = self.arena.next(id);
                freed += self.acknowledge(id) as usize;
                continue;
            }

            // node is past this pair, retry it against the next one
            pair_num += 1;
        }

        freed
    }

    /// Apply a cumulative ack and its SACK pairs
    ///
    /// Returns the number of nodes released (nodes still being transmitted
    /// count once, when they get tagged).
    pub fn process_ack(&mut self, ack_id: SeqId, sacks: &[SackPair]) -> usize {
        let had_cursor = self.cursor.is_some();
        let mut freed = self.free_ack(ack_id);
        if !sacks.is_empty() {
            freed += self.free_sack(sacks);
        }
        if (had_cursor && self.cursor.is_none()) || !sacks.is_empty() {
            self.rewind_cursor();
        }

        tracing::trace!(
            ack = %ack_id,
            sacks = sacks.len(),
            freed,
            remaining = self.arena.len(),
            "tx ack processed"
        );

        freed
    }

    /// Drop every stored node
    pub fn clear(&mut self) {
        self.arena.clear();
        self.cursor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(txb: &TxBuffer) -> Vec<(u32, usize, NodeState)> {
        txb.arena
            .iter()
            .map(|id| {
                let n = txb.arena.node(id);
                (n.seq_id.as_raw(), n.len, n.state)
            })
            .collect()
    }

    fn send_all(txb: &mut TxBuffer) -> Vec<SeqId> {
        let mut frame = vec![0u8; txb.elem_size()];
        let mut sent = Vec::new();
        while let Some(p) = txb.peek_next(&mut frame) {
            sent.push(p.seq_id());
            txb.return_after_send(p).unwrap();
        }
        sent
    }

    #[test]
    fn test_append_fills_tail_first() {
        let mut txb = TxBuffer::new(40, 10).unwrap();
        assert_eq!(txb.append(&[b"abcd"], 4).unwrap(), 4);
        assert_eq!(txb.free_bytes(), 36);

        assert_eq!(txb.append(&[b"efghijkl"], 8).unwrap(), 8);
        assert_eq!(
            states(&txb),
            vec![(0, 10, NodeState::Unsent), (10, 2, NodeState::Unsent)]
        );
        assert_eq!(txb.last_seq_id(), Some(SeqId::new(12)));
        assert_eq!(txb.free_bytes(), 28);
    }

    #[test]
    fn test_append_vectored() {
        let mut txb = TxBuffer::new(40, 4).unwrap();
        let n = txb.append(&[b"ab", b"cdef", b"ghi"], 8).unwrap();
        assert_eq!(n, 8);

        let mut frame = [0u8; 4];
        let p = txb.peek_next(&mut frame).unwrap();
        assert_eq!(&frame[..p.len()], b"abcd");
        txb.return_after_send(p).unwrap();
        let p = txb.peek_next(&mut frame).unwrap();
        assert_eq!(&frame[..p.len()], b"efgh");
        assert_eq!(p.seq_id(), SeqId::new(4));
    }

    #[test]
    fn test_append_is_atomic() {
        let mut txb = TxBuffer::new(20, 10).unwrap();
        txb.append(&[&[1u8; 15]], 15).unwrap();
        assert_eq!(txb.free_bytes(), 5);

        assert_eq!(
            txb.append(&[&[2u8; 6]], 6),
            Err(TxBufferError::OutOfMemory)
        );
        assert_eq!(txb.free_bytes(), 5);
        assert_eq!(txb.next_seq_id(), SeqId::new(15));

        assert_eq!(txb.append(&[&[2u8; 5]], 5).unwrap(), 5);
        assert_eq!(txb.free_bytes(), 0);
    }

    #[test]
    fn test_sent_tail_is_not_extended() {
        let mut txb = TxBuffer::new(40, 10).unwrap();
        txb.append(&[b"abc"], 3).unwrap();
        send_all(&mut txb);
        assert_eq!(txb.free_bytes(), 30);

        txb.append(&[b"def"], 3).unwrap();
        assert_eq!(
            states(&txb),
            vec![(0, 3, NodeState::Sent), (3, 3, NodeState::Unsent)]
        );
    }

    #[test]
    fn test_peek_and_return() {
        let mut txb = TxBuffer::new(30, 10).unwrap();
        txb.append(&[&[0u8; 25]], 25).unwrap();
        assert_eq!(
            send_all(&mut txb),
            vec![SeqId::new(0), SeqId::new(10), SeqId::new(20)]
        );
        assert!(!txb.has_sendable());
        assert!(states(&txb).iter().all(|s| s.2 == NodeState::Sent));
    }

    #[test]
    fn test_ack_during_send_defers_free() {
        let mut txb = TxBuffer::new(30, 10).unwrap();
        txb.append(&[&[0u8; 20]], 20).unwrap();

        let mut frame = [0u8; 10];
        let p = txb.peek_next(&mut frame).unwrap();
        assert_eq!(txb.process_ack(SeqId::new(10), &[]), 1);
        assert_eq!(txb.len(), 2);

        // acknowledged while in flight, a second ack does not count again
        assert_eq!(txb.process_ack(SeqId::new(10), &[]), 0);

        assert!(!txb.return_after_send(p).unwrap());
        assert_eq!(txb.len(), 1);
        assert_eq!(states(&txb), vec![(10, 10, NodeState::Unsent)]);

        let p = txb.peek_next(&mut frame).unwrap();
        assert!(txb.return_after_send(p).unwrap());
    }

    #[test]
    fn test_process_ack_is_idempotent() {
        let mut txb = TxBuffer::new(50, 10).unwrap();
        txb.append(&[&[0u8; 50]], 50).unwrap();
        send_all(&mut txb);

        assert_eq!(txb.process_ack(SeqId::new(30), &[]), 3);
        assert_eq!(txb.process_ack(SeqId::new(30), &[]), 0);
        assert_eq!(txb.len(), 2);
        assert_eq!(txb.free_bytes(), 30);
    }

    #[test]
    fn test_sack_frees_and_marks_holes() {
        let mut txb = TxBuffer::new(60, 10).unwrap();
        txb.append(&[&[0u8; 60]], 60).unwrap();
        send_all(&mut txb);

        // receiver has [0,10) in order, [20,30) and [40,60) out of order
        let sacks = [
            SackPair::new(SeqId::new(20), SeqId::new(29)),
            SackPair::new(SeqId::new(40), SeqId::new(59)),
        ];
        let freed = txb.process_ack(SeqId::new(10), &sacks);
        assert_eq!(freed, 4);
        assert_eq!(
            states(&txb),
            vec![(10, 10, NodeState::NeedResend), (30, 10, NodeState::NeedResend)]
        );

        assert_eq!(send_all(&mut txb), vec![SeqId::new(10), SeqId::new(30)]);
    }

    #[test]
    fn test_sack_pair_between_nodes_advances() {
        let mut txb = TxBuffer::new(40, 10).unwrap();
        txb.append(&[&[0u8; 40]], 40).unwrap();
        send_all(&mut txb);

        // first pair ends before the node at 20 starts
        let sacks = [
            SackPair::new(SeqId::new(10), SeqId::new(15)),
            SackPair::new(SeqId::new(30), SeqId::new(39)),
        ];
        let freed = txb.process_ack(SeqId::new(0), &sacks);
        assert_eq!(freed, 2);
        assert_eq!(
            states(&txb),
            vec![(0, 10, NodeState::NeedResend), (20, 10, NodeState::NeedResend)]
        );
    }

    #[test]
    fn test_mark_need_resend_all_skips_in_flight() {
        let mut txb = TxBuffer::new(40, 10).unwrap();
        txb.append(&[&[0u8; 30]], 30).unwrap();

        let mut frame = [0u8; 10];
        let first = txb.peek_next(&mut frame).unwrap();
        txb.return_after_send(first).unwrap();
        let in_flight = txb.peek_next(&mut frame).unwrap();

        txb.mark_need_resend_all();
        assert_eq!(
            states(&txb),
            vec![
                (0, 10, NodeState::NeedResend),
                (10, 10, NodeState::Sending),
                (20, 10, NodeState::Unsent),
            ]
        );

        txb.return_after_send(in_flight).unwrap();
        assert_eq!(send_all(&mut txb), vec![SeqId::new(0), SeqId::new(20)]);
    }

    #[test]
    fn test_flow_control_only_resends() {
        let mut txb = TxBuffer::new(40, 10).unwrap();
        txb.append(&[&[0u8; 10]], 10).unwrap();
        send_all(&mut txb);
        txb.append(&[&[0u8; 10]], 10).unwrap();

        txb.set_flow_control(true);
        assert!(!txb.has_sendable());

        txb.mark_need_resend_all();
        assert!(txb.has_sendable());
        assert_eq!(send_all(&mut txb), vec![SeqId::new(0)]);
        assert!(!txb.has_sendable());

        txb.set_flow_control(false);
        assert_eq!(send_all(&mut txb), vec![SeqId::new(10)]);
    }

    #[test]
    fn test_bad_return_state() {
        let mut txb = TxBuffer::new(20, 10).unwrap();
        txb.append(&[&[0u8; 10]], 10).unwrap();
        let mut frame = [0u8; 10];
        let p = txb.peek_next(&mut frame).unwrap();
        txb.arena.node_mut(p.id).state = NodeState::Sent;

        assert!(matches!(
            txb.return_after_send(p),
            Err(TxBufferError::BadReturnState { .. })
        ));
    }

    #[test]
    fn test_wraparound_sequence() {
        let start = SeqId::new(u32::MAX - 14);
        let mut txb = TxBuffer::with_start(40, 10, start).unwrap();
        txb.append(&[&[0u8; 30]], 30).unwrap();
        assert_eq!(txb.last_seq_id(), Some(SeqId::new(15)));
        send_all(&mut txb);

        assert_eq!(txb.process_ack(SeqId::new(5), &[]), 2);
        assert_eq!(states(&txb), vec![(5, 10, NodeState::Sent)]);
    }
}
