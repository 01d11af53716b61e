//! Receive window
//!
//! Incoming DATA payloads are kept in arena nodes ordered by sequence id. The
//! nodes starting at `reader_pos` without gaps form the contiguous prefix the
//! application can read; everything after the first gap is reported back to
//! the sender as SACK pairs.

use crate::arena::{Arena, ArenaError, NodeId, NodeState};
use crate::header::SackPair;
use crate::params::ALLOWED_FILL_PERCENTAGE;
use crate::wrap::SeqId;

/// Outcome of [`RxBuffer::put`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxPut {
    /// Stored
    Ok,
    /// Every byte was already read by the application
    Consumed,
    /// The exact same range is already stored
    Duplicate,
    /// Range overlaps stored data without matching it
    BadPacket,
    /// No room for the packet
    Overflow,
}

/// Reorder and reassembly buffer
pub struct RxBuffer {
    arena: Arena,
    /// Next stream byte the application will read
    reader_pos: SeqId,
    /// Bytes already read from the first node
    node_read_offset: usize,
    /// Last node of the contiguous prefix
    last_sequential: Option<NodeId>,
    /// Readable bytes in the contiguous prefix
    available_bytes: usize,
}

impl RxBuffer {
    pub fn new(buffer_bytes: usize, elem_size: usize) -> Result<Self, ArenaError> {
        Self::with_start(buffer_bytes, elem_size, SeqId::new(0))
    }

    /// Create a receive window expecting the stream to start at `start`
    pub fn with_start(
        buffer_bytes: usize,
        elem_size: usize,
        start: SeqId,
    ) -> Result<Self, ArenaError> {
        Ok(RxBuffer {
            arena: Arena::new(buffer_bytes, elem_size)?,
            reader_pos: start,
            node_read_offset: 0,
            last_sequential: None,
            available_bytes: 0,
        })
    }

    /// Total capacity in bytes
    pub fn size(&self) -> usize {
        self.arena.total_bytes()
    }

    pub fn elem_size(&self) -> usize {
        self.arena.elem_size()
    }

    /// Number of stored nodes
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn reader_pos(&self) -> SeqId {
        self.reader_pos
    }

    /// Bytes readable without waiting
    pub fn available_bytes(&self) -> usize {
        self.available_bytes
    }

    pub fn has_data(&self) -> bool {
        if self.node_read_offset != 0 {
            return true;
        }
        self.arena
            .first()
            .is_some_and(|id| self.arena.node(id).seq_id.eq(self.reader_pos))
    }

    /// Cumulative ack: the first sequence id not received in order
    pub fn ack_id(&self) -> SeqId {
        match self.last_sequential {
            Some(id) => self.arena.node(id).end(),
            None => self.reader_pos,
        }
    }

    /// Percentage of nodes in use, rounded up
    pub fn fill_percentage(&self) -> usize {
        (self.arena.n_filled() * 100).div_ceil(self.arena.n_nodes())
    }

    /// Whether the peer should be asked to suspend new data
    pub fn limit_exceeded(&self) -> bool {
        self.fill_percentage() > ALLOWED_FILL_PERCENTAGE
    }

    /// Find where a packet `[seq_id, end)` belongs
    ///
    /// `Ok(Some(id))` means insert before `id`, `Ok(None)` append at the tail.
    fn locate(&self, seq_id: SeqId, end: SeqId) -> Result<Option<NodeId>, RxPut> {
        if let Some(last) = self.arena.last() {
            if seq_id.ge(self.arena.node(last).end()) {
                return Ok(None);
            }
        }

        let start = match self.last_sequential {
            Some(id) if seq_id.gt(self.arena.node(id).seq_id) => Some(id),
            _ => self.arena.first(),
        };

        let mut it = start;
        while let Some(id) = it {
            let node = self.arena.node(id);
            let (left, right) = (node.seq_id, node.end());

            if seq_id.gt(left) {
                if seq_id.ge(right) {
                    it = self.arena.next(id);
                    continue;
                }
                return Err(RxPut::BadPacket);
            } else if seq_id.lt(left) {
                if end.le(left) {
                    return Ok(Some(id));
                }
                return Err(RxPut::BadPacket);
            } else if end.eq(right) {
                return Err(RxPut::Duplicate);
            } else {
                return Err(RxPut::BadPacket);
            }
        }

        Ok(None)
    }

    fn dump(&self) {
        for id in self.arena.iter() {
            let node = self.arena.node(id);
            tracing::debug!(
                left = %node.seq_id,
                right = %node.end(),
                len = node.len,
                last_sequential = self.last_sequential == Some(id),
                "rx node"
            );
        }
    }

    /// Classify and store a DATA payload
    pub fn put(&mut self, seq_id: SeqId, data: &[u8]) -> RxPut {
        let len = data.len();
        if len == 0 || len > self.arena.elem_size() {
            tracing::warn!(len, elem = self.arena.elem_size(), "rx packet does not fit a node");
            return RxPut::BadPacket;
        }

        let end = seq_id + len as u32;
        if end.le(self.reader_pos) {
            return RxPut::Consumed;
        }

        if seq_id.lt(self.reader_pos) {
            // straddles the read position: only a copy of the partially
            // read first node is acceptable
            let first = self.arena.first().map(|id| self.arena.node(id));
            return match first {
                Some(node) if node.seq_id.eq(seq_id) && node.len == len => RxPut::Duplicate,
                _ => {
                    tracing::warn!(
                        left = %seq_id,
                        right = %end,
                        reader_pos = %self.reader_pos,
                        "rx packet overlaps read position"
                    );
                    RxPut::BadPacket
                }
            };
        }

        let before = match self.locate(seq_id, end) {
            Ok(before) => before,
            Err(RxPut::BadPacket) => {
                tracing::warn!(left = %seq_id, right = %end, "rx packet does not fit");
                self.dump();
                return RxPut::BadPacket;
            }
            Err(result) => return result,
        };

        // keep the last node for the packet that fills the hole in front
        let hole_in_front = self
            .arena
            .first()
            .is_some_and(|id| self.arena.node(id).seq_id.gt(self.reader_pos));
        let free = self.arena.free_nodes();
        if free == 0 || (hole_in_front && free <= 1 && !seq_id.eq(self.reader_pos)) {
            return RxPut::Overflow;
        }

        let Some(id) = self.arena.alloc(NodeState::Received) else {
            return RxPut::Overflow;
        };
        {
            let (node, storage) = self.arena.split_mut(id);
            storage[..len].copy_from_slice(data);
            node.seq_id = seq_id;
            node.len = len;
        }
        match before {
            Some(at) => self.arena.insert_before(at, id),
            None => self.arena.push_back(id),
        }

        self.update_last_sequential();
        RxPut::Ok
    }

    fn update_last_sequential(&mut self) {
        let mut id = match self.last_sequential {
            Some(id) => id,
            None => {
                let Some(first) = self.arena.first() else {
                    return;
                };
                let node = self.arena.node(first);
                if !node.seq_id.eq(self.reader_pos) {
                    return;
                }
                self.last_sequential = Some(first);
                self.available_bytes = node.len;
                first
            }
        };

        let mut ack_id = self.arena.node(id).end();
        while let Some(next) = self.arena.next(id) {
            let node = self.arena.node(next);
            if !node.seq_id.eq(ack_id) {
                break;
            }
            ack_id = node.end();
            self.available_bytes += node.len;
            self.last_sequential = Some(next);
            id = next;
        }
    }

    /// Copy up to `out.len()` contiguous bytes starting at `reader_pos`
    pub fn get(&mut self, out: &mut [u8]) -> usize {
        let mut total = 0;

        while total < out.len() {
            let Some(id) = self.arena.first() else {
                break;
            };
            if self.arena.node(id).seq_id.gt(self.reader_pos + total as u32) {
                break;
            }

            let offset = self.node_read_offset;
            let data = self.arena.data(id);
            let to_copy = (out.len() - total).min(data.len() - offset);
            out[total..total + to_copy].copy_from_slice(&data[offset..offset + to_copy]);
            self.node_read_offset += to_copy;
            total += to_copy;

            if self.node_read_offset == data.len() {
                self.node_read_offset = 0;
                if self.last_sequential == Some(id) {
                    self.last_sequential = None;
                }
                self.arena.remove(id);
            }
        }

        self.reader_pos += total as u32;
        self.available_bytes -= total;
        total
    }

    /// Describe the out-of-order runs after the contiguous prefix
    pub fn generate_sack_pairs(&self, max_pairs: usize) -> Vec<SackPair> {
        let mut pairs = Vec::new();
        if max_pairs == 0 {
            return pairs;
        }

        let start = match self.last_sequential {
            Some(id) => self.arena.next(id),
            None => self.arena.first(),
        };
        let Some(start) = start else {
            return pairs;
        };

        let node = self.arena.node(start);
        let (mut left, mut end) = (node.seq_id, node.end());

        let mut it = self.arena.next(start);
        while let Some(id) = it {
            let node = self.arena.node(id);
            if node.seq_id.eq(end) {
                end = node.end();
            } else {
                pairs.push(SackPair::new(left, end - 1));
                if pairs.len() == max_pairs {
                    return pairs;
                }
                left = node.seq_id;
                end = node.end();
            }
            it = self.arena.next(id);
        }

        pairs.push(SackPair::new(left, end - 1));
        pairs
    }

    /// Drop every stored node
    pub fn clear(&mut self) {
        self.arena.clear();
        self.last_sequential = None;
        self.node_read_offset = 0;
        self.available_bytes = 0;
    }
}
