//! The arena: one reserved region carved into address-ordered nodes.
//!
//! Every block of the arena, free or in use, starts with an in-band node
//! header. Headers are addressed by their byte offset from the arena base, so
//! nothing here ever stores a raw pointer into the arena:
//!
//! ```text
//!   offset 0                                                      len
//!   ┌────────┬──────────────┬────────┬──────────┬────────┬──────────┐
//!   │ header │ payload      │ header │ payload  │ header │ payload  │
//!   │ in use │ (client)     │ free   │ next_free│ free   │ next_free│
//!   └────────┴──────────────┴────────┴──────────┴────────┴──────────┘
//! ```
//!
//! Nodes are doubly linked in address order and tile the arena with no gaps.
//! Free nodes are additionally threaded onto a singly-linked free list whose
//! link lives in the first word of the free node's payload. That list is
//! unordered: freed nodes are pushed at its head.

use core::{alloc::Layout, fmt, ptr::NonNull};

use super::Coalesce;
use node::{FreeNode, Header, NodeId, MIN_FREE_PAYLOAD};
pub use node::HEADER_SIZE;

/// Granularity every request is rounded up to, and the alignment of every
/// pointer handed out.
pub const ALIGNMENT: usize = 8;

/// Alignment of the arena base.
pub(super) const ARENA_ALIGN: usize = if node::HEADER_ALIGN > ALIGNMENT {
    node::HEADER_ALIGN
} else {
    ALIGNMENT
};

/// The smallest arena that can hold a single free node.
pub(super) const MIN_ARENA_SIZE: usize = HEADER_SIZE + MIN_FREE_PAYLOAD;

/// Round `size` up to a multiple of [`ALIGNMENT`], or `None` on overflow.
#[inline]
pub(super) const fn align_up(size: usize) -> Option<usize> {
    match size.checked_add(ALIGNMENT - 1) {
        Some(padded) => Some(padded & !(ALIGNMENT - 1)),
        None => None,
    }
}

pub(super) struct Arena {
    /// Start of the reserved region; the first node's header lives here.
    base: NonNull<u8>,

    /// The layout the region was reserved with, needed to give it back.
    layout: Layout,

    /// Number of bytes actually tiled by nodes: `layout.size()` rounded down
    /// to [`ALIGNMENT`].
    len: usize,

    /// Head of the address-order list. Always the node at offset zero, since
    /// merging only ever absorbs a node into its predecessor.
    first: NodeId,

    /// Head of the free list.
    first_free: Option<FreeNode>,
}

// Safety: the arena exclusively owns its region; the `NonNull` is never
// shared outside of the heap's mutex.
unsafe impl Send for Arena {}

impl Arena {
    /// Take ownership of a freshly reserved region and lay a single free node
    /// across all of it.
    ///
    /// ### Safety
    ///
    /// `base` must be valid for reads and writes of `layout.size()` bytes,
    /// aligned to [`ARENA_ALIGN`], and not used by anything else for as long
    /// as the arena lives.
    pub(super) unsafe fn new(base: NonNull<u8>, layout: Layout) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % ARENA_ALIGN, 0);
        debug_assert!(layout.size() >= MIN_ARENA_SIZE);

        let len = layout.size() & !(ALIGNMENT - 1);
        let first = NodeId::at(0);
        let mut arena = Arena {
            base,
            layout,
            len,
            first,
            first_free: None,
        };
        arena.write_header(
            first,
            Header {
                next: None,
                prev: None,
                size: len - HEADER_SIZE,
                is_free: true,
            },
        );
        let first_free = FreeNode::new_unchecked(first);
        arena.set_next_free(first_free, None);
        arena.first_free = Some(first_free);
        arena
    }

    pub(super) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(super) fn layout(&self) -> Layout {
        self.layout
    }

    /// First-fit search of the free list for a node with at least `size`
    /// usable bytes, splitting off the remainder when it can stand on its own.
    ///
    /// Returns the payload pointer of the chosen node. A failed search leaves
    /// the arena untouched.
    pub(super) fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert_ne!(size, 0);
        let size = align_up(size)?;

        let mut prev_free: Option<FreeNode> = None;
        let mut current = self.first_free;
        while let Some(node) = current {
            let header = self.header(node.id());
            debug_assert!(header.is_free, "free list entry {node:?} is in use");
            let next_free = self.next_free(node);

            if header.size >= size {
                let replacement = if header.size - size >= HEADER_SIZE + MIN_FREE_PAYLOAD {
                    let rest = self.split(node.id(), size);
                    self.set_next_free(rest, next_free);
                    Some(rest)
                } else {
                    next_free
                };
                match prev_free {
                    Some(prev) => self.set_next_free(prev, replacement),
                    None => self.first_free = replacement,
                }

                self.header_mut(node.id()).is_free = false;
                let ptr = self.payload(node.id());
                debug_assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
                return Some(ptr);
            }

            prev_free = Some(node);
            current = next_free;
        }

        None
    }

    /// Return the node owning `ptr` to the arena.
    ///
    /// The node is merged into its address-order predecessor when that one is
    /// free, otherwise it is pushed onto the head of the free list. With
    /// [`Coalesce::Bidirectional`] a free successor is absorbed as well.
    ///
    /// ### Safety
    ///
    /// `ptr` must have been returned by [`Arena::allocate`] on this arena and
    /// not freed since.
    pub(super) unsafe fn free(&mut self, ptr: NonNull<u8>, coalesce: Coalesce) {
        let node = self.node_from_ptr(ptr);
        let header = self.header(node);
        debug_assert!(!header.is_free, "double free of {ptr:p}");
        self.header_mut(node).is_free = true;

        let record = match header.prev.and_then(|prev| self.as_free(prev)) {
            Some(prev) => {
                self.absorb_next(prev);
                prev
            }
            None => {
                let node = FreeNode::new_unchecked(node);
                self.set_next_free(node, self.first_free);
                self.first_free = Some(node);
                node
            }
        };

        if coalesce == Coalesce::Bidirectional {
            if let Some(next) = self.header(record.id()).next.and_then(|n| self.as_free(n)) {
                self.unlink_free(next);
                self.absorb_next(record);
            }
        }
    }

    /// The usable payload size of the node owning `ptr`.
    ///
    /// ### Safety
    ///
    /// `ptr` must be a live allocation from this arena.
    pub(super) unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.header(self.node_from_ptr(ptr)).size
    }

    /// Visit every node in address order.
    pub(super) fn try_for_each_node<E>(
        &self,
        mut f: impl FnMut(NodeInfo) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut current = Some(self.first);
        while let Some(node) = current {
            let header = self.header(node);
            f(NodeInfo {
                // Safety: every node id refers to a header inside the arena.
                address: unsafe { self.base.add(node.offset()) },
                offset: node.offset(),
                size: header.size,
                is_free: header.is_free,
            })?;
            current = header.next;
        }
        Ok(())
    }

    pub(super) fn free_list_len(&self) -> usize {
        let mut len = 0;
        let mut current = self.first_free;
        while let Some(node) = current {
            len += 1;
            current = self.next_free(node);
        }
        len
    }

    /// Walk both lists and check every structural invariant of the arena.
    pub(super) fn check_integrity(&self) -> Result<(), IntegrityError> {
        // No valid chain can hold more nodes than this.
        let max_nodes = self.len / (HEADER_SIZE + MIN_FREE_PAYLOAD);

        let mut free_nodes = 0;
        let mut prev: Option<NodeId> = None;
        let mut expected_offset = 0;
        let mut current = Some(self.first);
        let mut visited = 0;
        while let Some(node) = current {
            visited += 1;
            if visited > max_nodes {
                return Err(IntegrityError::AddressOrderCycle);
            }
            if node.offset() != expected_offset {
                return Err(IntegrityError::Gap {
                    expected: expected_offset,
                    found: node.offset(),
                });
            }
            let header = self.header(node);
            if header.prev != prev {
                return Err(IntegrityError::BrokenBackLink {
                    offset: node.offset(),
                });
            }
            let end = node
                .payload_offset()
                .checked_add(header.size)
                .filter(|end| *end <= self.len)
                .ok_or(IntegrityError::Overrun {
                    offset: node.offset(),
                    size: header.size,
                })?;
            if header.size % ALIGNMENT != 0 {
                return Err(IntegrityError::Misaligned {
                    offset: node.offset(),
                    size: header.size,
                });
            }
            if header.is_free {
                free_nodes += 1;
            }
            prev = Some(node);
            expected_offset = end;
            current = header.next;
        }
        if expected_offset != self.len {
            return Err(IntegrityError::Gap {
                expected: self.len,
                found: expected_offset,
            });
        }

        let mut listed = 0;
        let mut current = self.first_free;
        while let Some(node) = current {
            listed += 1;
            if listed > free_nodes {
                return Err(IntegrityError::FreeListCycle);
            }
            if !self.header(node.id()).is_free {
                return Err(IntegrityError::FreeListEntryInUse {
                    offset: node.id().offset(),
                });
            }
            current = self.next_free(node);
        }
        if listed != free_nodes {
            return Err(IntegrityError::UnlistedFreeNode {
                listed,
                free: free_nodes,
            });
        }

        Ok(())
    }

    /// Carve `size` bytes off the front of `node` and turn the rest into a new
    /// free node right after it. The caller links the new node into the free
    /// list.
    fn split(&mut self, node: NodeId, size: usize) -> FreeNode {
        let header = self.header(node);
        debug_assert!(header.size >= size + HEADER_SIZE + MIN_FREE_PAYLOAD);

        let rest = NodeId::at(node.payload_offset() + size);
        self.write_header(
            rest,
            Header {
                next: header.next,
                prev: Some(node),
                size: header.size - size - HEADER_SIZE,
                is_free: true,
            },
        );
        if let Some(next) = header.next {
            self.header_mut(next).prev = Some(rest);
        }
        let current = self.header_mut(node);
        current.next = Some(rest);
        current.size = size;

        FreeNode::new_unchecked(rest)
    }

    /// Merge the address-order successor of `left` into it. `left` keeps its
    /// place in the free list; the successor must no longer be listed.
    fn absorb_next(&mut self, left: FreeNode) {
        let header = self.header(left.id());
        let Some(right) = header.next else {
            debug_assert!(false, "no successor to absorb into {left:?}");
            return;
        };
        let right_header = self.header(right);

        let merged = self.header_mut(left.id());
        merged.size += right_header.size + HEADER_SIZE;
        merged.next = right_header.next;
        if let Some(next) = right_header.next {
            self.header_mut(next).prev = Some(left.id());
        }
    }

    /// Remove `target` from the free list.
    fn unlink_free(&mut self, target: FreeNode) {
        let successor = self.next_free(target);
        if self.first_free == Some(target) {
            self.first_free = successor;
            return;
        }

        let mut current = self.first_free;
        while let Some(node) = current {
            let next = self.next_free(node);
            if next == Some(target) {
                self.set_next_free(node, successor);
                return;
            }
            current = next;
        }
        debug_assert!(false, "{target:?} is free but not on the free list");
    }

    fn as_free(&self, node: NodeId) -> Option<FreeNode> {
        self.header(node)
            .is_free
            .then(|| FreeNode::new_unchecked(node))
    }

    fn node_from_ptr(&self, ptr: NonNull<u8>) -> NodeId {
        let offset = (ptr.as_ptr() as usize)
            .wrapping_sub(self.base.as_ptr() as usize)
            .wrapping_sub(HEADER_SIZE);
        debug_assert!(
            offset < self.len && offset % ALIGNMENT == 0,
            "{ptr:p} was not allocated from this arena"
        );
        NodeId::at(offset)
    }

    fn payload(&self, node: NodeId) -> NonNull<u8> {
        // Safety: node ids always refer to headers inside the arena, and the
        // payload starts within (or exactly at the end of) the region.
        unsafe { self.base.add(node.payload_offset()) }
    }

    fn header_ptr(&self, node: NodeId) -> *mut Header {
        debug_assert!(node.offset() + HEADER_SIZE <= self.len);
        // Safety: as above; headers sit at `ALIGNMENT`-multiple offsets from
        // an `ARENA_ALIGN`-aligned base.
        unsafe { self.base.add(node.offset()).cast::<Header>().as_ptr() }
    }

    fn header(&self, node: NodeId) -> Header {
        unsafe { self.header_ptr(node).read() }
    }

    fn header_mut(&mut self, node: NodeId) -> &mut Header {
        unsafe { &mut *self.header_ptr(node) }
    }

    fn write_header(&mut self, node: NodeId, header: Header) {
        unsafe { self.header_ptr(node).write(header) }
    }

    /// The free-list link stored in the payload of a free node.
    fn next_free(&self, node: FreeNode) -> Option<FreeNode> {
        unsafe { self.next_free_ptr(node).read() }
    }

    fn set_next_free(&mut self, node: FreeNode, next: Option<FreeNode>) {
        unsafe { self.next_free_ptr(node).write(next) }
    }

    fn next_free_ptr(&self, node: FreeNode) -> *mut Option<FreeNode> {
        self.payload(node.id()).cast::<Option<FreeNode>>().as_ptr()
    }
}

/// A snapshot of one node, as reported by the heap walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    /// Address of the node's header.
    pub address: NonNull<u8>,
    /// Byte offset of the header from the start of the arena.
    pub offset: usize,
    /// Usable payload bytes, excluding the header.
    pub size: usize,
    /// Whether the node is on the free list.
    pub is_free: bool,
}

impl NodeInfo {
    /// Address of the first payload byte.
    pub fn payload(&self) -> NonNull<u8> {
        // Safety: a node's payload directly follows its header in the arena.
        unsafe { self.address.add(HEADER_SIZE) }
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node: {:p}, size: {}, is_free: {}",
            self.address,
            self.size,
            u8::from(self.is_free)
        )
    }
}

/// A structural violation found by [`Heap::check_integrity`][super::Heap::check_integrity].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntegrityError {
    /// A node does not start where its predecessor ends, or the last node does
    /// not end at the end of the arena.
    Gap {
        /// Offset at which a node (or the arena end) was expected.
        expected: usize,
        /// Offset actually found.
        found: usize,
    },
    /// A node's `prev` link does not point at its address-order predecessor.
    BrokenBackLink {
        /// Offset of the offending node.
        offset: usize,
    },
    /// A node's payload extends past the end of the arena.
    Overrun {
        /// Offset of the offending node.
        offset: usize,
        /// Its recorded payload size.
        size: usize,
    },
    /// A node's payload size is not a multiple of [`ALIGNMENT`].
    Misaligned {
        /// Offset of the offending node.
        offset: usize,
        /// Its recorded payload size.
        size: usize,
    },
    /// Following `next` links never reaches the end of the arena.
    AddressOrderCycle,
    /// The free list is longer than the number of free nodes.
    FreeListCycle,
    /// The free list links a node that is in use.
    FreeListEntryInUse {
        /// Offset of the offending node.
        offset: usize,
    },
    /// Some free nodes are not on the free list.
    UnlistedFreeNode {
        /// Entries on the free list.
        listed: usize,
        /// Free nodes in address order.
        free: usize,
    },
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityError::Gap { expected, found } => {
                write!(f, "expected a node boundary at {expected:#x}, found {found:#x}")
            }
            IntegrityError::BrokenBackLink { offset } => {
                write!(f, "node at {offset:#x} has a stale `prev` link")
            }
            IntegrityError::Overrun { offset, size } => {
                write!(f, "node at {offset:#x} of size {size} overruns the arena")
            }
            IntegrityError::Misaligned { offset, size } => {
                write!(f, "node at {offset:#x} has unaligned size {size}")
            }
            IntegrityError::AddressOrderCycle => {
                f.write_str("address-order list does not terminate")
            }
            IntegrityError::FreeListCycle => f.write_str("free list does not terminate"),
            IntegrityError::FreeListEntryInUse { offset } => {
                write!(f, "free list links in-use node at {offset:#x}")
            }
            IntegrityError::UnlistedFreeNode { listed, free } => {
                write!(f, "{free} free nodes but only {listed} on the free list")
            }
        }
    }
}

impl core::error::Error for IntegrityError {}

mod node {
    use core::{mem, num::NonZeroUsize};

    use super::ALIGNMENT;

    /// The identity of a node: its header's byte offset from the arena base,
    /// stored off by one so that `Option<NodeId>` is a single word.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub(in crate::heap) struct NodeId(NonZeroUsize);

    impl NodeId {
        #[inline]
        pub(in crate::heap) fn at(offset: usize) -> Self {
            match NonZeroUsize::new(offset.wrapping_add(1)) {
                Some(id) => NodeId(id),
                None => unreachable!("node offset overflow"),
            }
        }

        #[inline]
        pub(in crate::heap) fn offset(self) -> usize {
            self.0.get() - 1
        }

        #[inline]
        pub(in crate::heap) fn payload_offset(self) -> usize {
            self.offset() + HEADER_SIZE
        }
    }

    impl core::fmt::Debug for NodeId {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            write!(f, "node@{:#x}", self.offset())
        }
    }

    /// A node known to be free, and therefore whose payload holds a free-list
    /// link rather than client bytes. Only the arena creates these, right
    /// after observing or setting `is_free`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    #[repr(transparent)]
    pub(in crate::heap) struct FreeNode(NodeId);

    impl FreeNode {
        #[inline]
        pub(in crate::heap) fn new_unchecked(node: NodeId) -> Self {
            FreeNode(node)
        }

        #[inline]
        pub(in crate::heap) fn id(self) -> NodeId {
            self.0
        }
    }

    impl core::fmt::Debug for FreeNode {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            write!(f, "free {:?}", self.0)
        }
    }

    /// The in-band header in front of every block.
    #[derive(Clone, Copy, Debug)]
    #[repr(C)]
    pub(in crate::heap) struct Header {
        /// Next node in address order.
        pub(in crate::heap) next: Option<NodeId>,
        /// Previous node in address order.
        pub(in crate::heap) prev: Option<NodeId>,
        /// Usable payload bytes; does not include the header.
        pub(in crate::heap) size: usize,
        pub(in crate::heap) is_free: bool,
    }

    pub(in crate::heap) const HEADER_ALIGN: usize = mem::align_of::<Header>();

    /// Size of a node header, padded so payloads stay [`ALIGNMENT`]-aligned.
    pub const HEADER_SIZE: usize = (mem::size_of::<Header>() + ALIGNMENT - 1) & !(ALIGNMENT - 1);

    /// A free node's payload must fit its free-list link.
    pub(in crate::heap) const MIN_FREE_PAYLOAD: usize = mem::size_of::<Option<FreeNode>>();

    const _: () = assert!(mem::size_of::<Option<NodeId>>() == mem::size_of::<usize>());
    const _: () = assert!(MIN_FREE_PAYLOAD <= ALIGNMENT);
    const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{alloc, vec::Vec};

    /// An arena over a `std`-allocated region, released on drop.
    struct TestArena {
        arena: Arena,
    }

    impl TestArena {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, ARENA_ALIGN).unwrap();
            let base = NonNull::new(unsafe { alloc::alloc(layout) }).unwrap();
            TestArena {
                arena: unsafe { Arena::new(base, layout) },
            }
        }

        fn nodes(&self) -> Vec<(usize, usize, bool)> {
            let mut nodes = Vec::new();
            self.arena
                .try_for_each_node(|n| {
                    nodes.push((n.offset, n.size, n.is_free));
                    Ok::<_, ()>(())
                })
                .unwrap();
            nodes
        }
    }

    impl Drop for TestArena {
        fn drop(&mut self) {
            unsafe { alloc::dealloc(self.arena.base().as_ptr(), self.arena.layout()) }
        }
    }

    #[test]
    fn align_up_rounds_to_eight() {
        assert_eq!(align_up(1), Some(8));
        assert_eq!(align_up(8), Some(8));
        assert_eq!(align_up(9), Some(16));
        assert_eq!(align_up(100), Some(104));
        assert_eq!(align_up(usize::MAX), None);
    }

    #[test]
    fn new_arena_is_one_free_node() {
        let t = TestArena::new(1024);
        assert_eq!(t.nodes(), [(0, 1024 - HEADER_SIZE, true)]);
        assert_eq!(t.arena.free_list_len(), 1);
        t.arena.check_integrity().unwrap();
    }

    #[test]
    fn arena_length_is_rounded_down() {
        let t = TestArena::new(1024 + 5);
        assert_eq!(t.nodes(), [(0, 1024 - HEADER_SIZE, true)]);
        t.arena.check_integrity().unwrap();
    }

    #[test]
    fn allocate_splits_and_keeps_free_list_position() {
        let mut t = TestArena::new(1024);
        let a = t.arena.allocate(100).unwrap();
        assert_eq!(a.as_ptr() as usize - t.arena.base().as_ptr() as usize, HEADER_SIZE);
        let rest = 1024 - 2 * HEADER_SIZE - 104;
        assert_eq!(t.nodes(), [(0, 104, false), (HEADER_SIZE + 104, rest, true)]);
        assert_eq!(t.arena.free_list_len(), 1);
        t.arena.check_integrity().unwrap();
    }

    #[test]
    fn small_remainder_is_consumed_whole() {
        let mut t = TestArena::new(1024);
        let whole = 1024 - HEADER_SIZE;
        // Leave less than a header plus a link behind.
        let ptr = t.arena.allocate(whole - HEADER_SIZE).unwrap();
        assert_eq!(t.nodes(), [(0, whole, false)]);
        assert_eq!(unsafe { t.arena.usable_size(ptr) }, whole);
        assert_eq!(t.arena.free_list_len(), 0);
        assert!(t.arena.allocate(1).is_none());
        t.arena.check_integrity().unwrap();
    }

    #[test]
    fn remainder_of_exactly_header_plus_link_is_split() {
        let mut t = TestArena::new(1024);
        let whole = 1024 - HEADER_SIZE;
        t.arena
            .allocate(whole - HEADER_SIZE - MIN_FREE_PAYLOAD)
            .unwrap();
        let nodes = t.nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].1, MIN_FREE_PAYLOAD);
        t.arena.check_integrity().unwrap();
    }

    #[test]
    fn first_fit_takes_first_large_enough_entry() {
        let mut t = TestArena::new(4096);
        let a = t.arena.allocate(64).unwrap();
        let _b = t.arena.allocate(8).unwrap();
        let c = t.arena.allocate(256).unwrap();
        let _d = t.arena.allocate(8).unwrap();
        unsafe {
            t.arena.free(a, Coalesce::Backward);
            t.arena.free(c, Coalesce::Backward);
        }
        // Free list is now [c, a, tail]; c is the first that fits 32 bytes,
        // even though a is a tighter fit.
        assert_eq!(t.arena.allocate(32), Some(c));
        t.arena.check_integrity().unwrap();
    }

    #[test]
    fn free_pushes_at_head_when_predecessor_in_use() {
        let mut t = TestArena::new(1024);
        let a = t.arena.allocate(16).unwrap();
        let b = t.arena.allocate(16).unwrap();
        unsafe { t.arena.free(b, Coalesce::Backward) };
        assert_eq!(t.arena.free_list_len(), 2);
        // The head of the free list is `b` again.
        assert_eq!(t.arena.allocate(16), Some(b));
        let _ = a;
        t.arena.check_integrity().unwrap();
    }

    #[test]
    fn bidirectional_unlinks_absorbed_successor() {
        let mut t = TestArena::new(1024);
        let a = t.arena.allocate(16).unwrap();
        let b = t.arena.allocate(16).unwrap();
        let c = t.arena.allocate(16).unwrap();
        unsafe {
            t.arena.free(c, Coalesce::Bidirectional);
            t.arena.free(a, Coalesce::Bidirectional);
            // `b` merges back into `a` and forward into `c`, which had
            // already absorbed the tail.
            t.arena.free(b, Coalesce::Bidirectional);
        }
        assert_eq!(t.nodes(), [(0, 1024 - HEADER_SIZE, true)]);
        assert_eq!(t.arena.free_list_len(), 1);
        t.arena.check_integrity().unwrap();
    }

    #[test]
    fn integrity_check_catches_corruption() {
        let mut t = TestArena::new(1024);
        let a = t.arena.allocate(16).unwrap();
        t.arena.header_mut(NodeId::at(0)).size += ALIGNMENT;
        assert!(matches!(
            t.arena.check_integrity(),
            Err(IntegrityError::Gap { .. })
        ));
        t.arena.header_mut(NodeId::at(0)).size -= ALIGNMENT;

        t.arena.header_mut(NodeId::at(0)).is_free = true;
        assert_eq!(
            t.arena.check_integrity(),
            Err(IntegrityError::UnlistedFreeNode { listed: 1, free: 2 })
        );
        let _ = a;
    }
}
