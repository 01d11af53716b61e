//! Packet node arena
//!
//! Both windows store their data in fixed-size nodes taken from a bounded
//! pool. The pool is allocated once, as a single slab, when the window is
//! created; afterwards allocation is a pop from a free list and never touches
//! the heap. Running out of nodes is the only backpressure mechanism of the
//! protocol.
//!
//! The arena also carries the ordered list of the window that owns it. Links
//! are node indices, so a node is either free, allocated-but-unlinked or
//! linked into exactly one list.

use crate::wrap::SeqId;
use thiserror::Error;

/// Arena construction errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArenaError {
    #[error("node capacity must be non-zero")]
    ZeroCapacity,

    #[error("buffer size must be non-zero")]
    ZeroBuffer,

    #[error("too many nodes: {0}")]
    TooManyNodes(usize),
}

/// Handle of a node inside one arena
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Life-cycle tag of a node
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// In the free list
    Free,
    /// TX: holds data that has never been transmitted
    Unsent,
    /// TX: handed out to the transmitter, which writes it without the lock
    Sending,
    /// TX: transmitted and waiting for an acknowledgement
    Sent,
    /// TX: must be transmitted again
    NeedResend,
    /// TX: acknowledged while being transmitted; freed on return
    Acknowledged,
    /// RX: holds received data
    Received,
}

/// Per-node metadata
#[derive(Debug, Clone)]
pub struct Node {
    /// Sequence id of the first byte
    pub seq_id: SeqId,
    /// Number of valid bytes
    pub len: usize,
    /// Current state
    pub state: NodeState,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    linked: bool,
}

impl Node {
    /// Sequence id right after the last byte
    #[inline]
    pub fn end(&self) -> SeqId {
        self.seq_id + self.len as u32
    }

    fn empty() -> Self {
        Node {
            seq_id: SeqId::new(0),
            len: 0,
            state: NodeState::Free,
            prev: None,
            next: None,
            linked: false,
        }
    }
}

/// Bounded pool of fixed-capacity nodes plus the owner's ordered list
pub struct Arena {
    nodes: Vec<Node>,
    slab: Box<[u8]>,
    elem_size: usize,
    free: Vec<NodeId>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    linked: usize,
}

impl Arena {
    /// Create an arena of `ceil(buffer_bytes / elem_size)` nodes
    pub fn new(buffer_bytes: usize, elem_size: usize) -> Result<Self, ArenaError> {
        if elem_size == 0 {
            return Err(ArenaError::ZeroCapacity);
        }
        if buffer_bytes == 0 {
            return Err(ArenaError::ZeroBuffer);
        }

        let n_nodes = buffer_bytes.div_ceil(elem_size);
        if n_nodes > u32::MAX as usize {
            return Err(ArenaError::TooManyNodes(n_nodes));
        }

        let nodes = vec![Node::empty(); n_nodes];
        let slab = vec![0u8; n_nodes * elem_size].into_boxed_slice();
        // reversed so that allocation hands out low indices first
        let free = (0..n_nodes as u32).rev().map(NodeId).collect();

        Ok(Arena {
            nodes,
            slab,
            elem_size,
            free,
            head: None,
            tail: None,
            linked: 0,
        })
    }

    /// Capacity of a single node in bytes
    #[inline]
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Total number of nodes
    #[inline]
    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Number of allocated nodes
    #[inline]
    pub fn n_filled(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Number of nodes still available
    #[inline]
    pub fn free_nodes(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn has_space(&self) -> bool {
        !self.free.is_empty()
    }

    /// Total payload bytes the arena can hold
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.nodes.len() * self.elem_size
    }

    /// Take a node from the pool
    pub fn alloc(&mut self, state: NodeState) -> Option<NodeId> {
        let id = self.free.pop()?;
        let node = &mut self.nodes[id.index()];
        node.seq_id = SeqId::new(0);
        node.len = 0;
        node.state = state;
        Some(id)
    }

    /// Return an unlinked node to the pool
    pub fn free(&mut self, id: NodeId) {
        let node = &mut self.nodes[id.index()];
        debug_assert!(!node.linked, "freeing a linked node");
        debug_assert!(node.state != NodeState::Free, "double free");
        node.state = NodeState::Free;
        node.len = 0;
        self.free.push(id);
    }

    /// Unlink a node and return it to the pool
    pub fn remove(&mut self, id: NodeId) {
        self.unlink(id);
        self.free(id);
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Valid bytes of the node
    pub fn data(&self, id: NodeId) -> &[u8] {
        let start = id.index() * self.elem_size;
        let len = self.nodes[id.index()].len;
        &self.slab[start..start + len]
    }

    /// Metadata and the whole backing storage of the node
    pub fn split_mut(&mut self, id: NodeId) -> (&mut Node, &mut [u8]) {
        let start = id.index() * self.elem_size;
        let storage = &mut self.slab[start..start + self.elem_size];
        (&mut self.nodes[id.index()], storage)
    }

    #[inline]
    pub fn first(&self) -> Option<NodeId> {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Option<NodeId> {
        self.tail
    }

    #[inline]
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].next
    }

    #[inline]
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].prev
    }

    /// Number of linked nodes
    #[inline]
    pub fn len(&self) -> usize {
        self.linked
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append an allocated node to the end of the list
    pub fn push_back(&mut self, id: NodeId) {
        debug_assert!(!self.nodes[id.index()].linked);
        let tail = self.tail;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = tail;
            node.next = None;
            node.linked = true;
        }
        match tail {
            Some(t) => self.nodes[t.index()].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.linked += 1;
    }

    /// Link an allocated node right before `at`
    pub fn insert_before(&mut self, at: NodeId, id: NodeId) {
        debug_assert!(self.nodes[at.index()].linked);
        debug_assert!(!self.nodes[id.index()].linked);
        let prev = self.nodes[at.index()].prev;
        {
            let node = &mut self.nodes[id.index()];
            node.prev = prev;
            node.next = Some(at);
            node.linked = true;
        }
        self.nodes[at.index()].prev = Some(id);
        match prev {
            Some(p) => self.nodes[p.index()].next = Some(id),
            None => self.head = Some(id),
        }
        self.linked += 1;
    }

    /// Detach a node from the list, keeping it allocated
    pub fn unlink(&mut self, id: NodeId) {
        let (prev, next) = {
            let node = &mut self.nodes[id.index()];
            debug_assert!(node.linked, "unlinking a detached node");
            let links = (node.prev, node.next);
            node.prev = None;
            node.next = None;
            node.linked = false;
            links
        };
        match prev {
            Some(p) => self.nodes[p.index()].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n.index()].prev = prev,
            None => self.tail = prev,
        }
        self.linked -= 1;
    }

    /// Iterate over linked nodes in list order
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            arena: self,
            cursor: self.head,
        }
    }

    /// Free every linked node (teardown)
    pub fn clear(&mut self) {
        while let Some(id) = self.head {
            self.remove(id);
        }
    }
}

/// List iterator yielding node handles
pub struct Iter<'a> {
    arena: &'a Arena,
    cursor: Option<NodeId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cursor?;
        self.cursor = self.arena.next(id);
        Some(id)
    }
}
