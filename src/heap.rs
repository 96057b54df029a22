//! The heap handle.
//!
//! A [`Heap`] owns at most one arena, reserved from its backing allocator the
//! first time any operation needs it, and then carved up with a first-fit
//! search over an unordered free list:
//!
//! * Allocation walks the free list and takes the first node with enough room.
//!   If what is left over can hold another header plus a free-list link, the
//!   node is split and the remainder takes the original's place in the free
//!   list; otherwise the whole node is handed out.
//!
//! * Freeing merges the node into its address-order predecessor if that one is
//!   free, and otherwise pushes it on the head of the free list. Merging with a
//!   free *successor* would mean finding it in a singly-linked, unordered list,
//!   so by default it is not done; see [`Coalesce`].
//!
//! `calloc` and `realloc` are built strictly on top of those two operations.

use core::{alloc::Layout, fmt, ptr, ptr::NonNull};

use super::*;
use arena::{Arena, ARENA_ALIGN, MIN_ARENA_SIZE};

mod arena;
pub use arena::{IntegrityError, NodeInfo, ALIGNMENT, HEADER_SIZE};

mod mutex;
use mutex::Mutex;
pub use mutex::{Lock, SingleThreadedLock, SpinLock};

/// The arena size used by [`HeapConfig::DEFAULT`].
///
/// This is address space, not memory: with the [`Mmap`][crate::Mmap] backing
/// the pages are only committed when first touched.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_ARENA_SIZE: usize = 10 * 1024 * 1024 * 1024;

/// The arena size used by [`HeapConfig::DEFAULT`].
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_ARENA_SIZE: usize = 256 * 1024 * 1024;

/// Which neighbors a freed block is merged with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Coalesce {
    /// Only merge into a free address-order predecessor.
    ///
    /// Freeing is O(1), but a free block followed by another free block stays
    /// split until the block before them both is freed.
    #[default]
    Backward,

    /// Also absorb a free address-order successor.
    ///
    /// The successor has to be unlinked from the singly-linked free list, which
    /// makes freeing O(free nodes).
    Bidirectional,
}

/// Configuration for a [`Heap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Size in bytes of the arena reserved from the backing allocator. Rounded
    /// down to [`ALIGNMENT`]; must fit at least one header and one free-list
    /// link.
    pub arena_size: usize,

    /// Coalescing policy applied on every free.
    pub coalesce: Coalesce,
}

impl HeapConfig {
    /// A [`DEFAULT_ARENA_SIZE`] arena with [`Coalesce::Backward`].
    pub const DEFAULT: HeapConfig = HeapConfig {
        arena_size: DEFAULT_ARENA_SIZE,
        coalesce: Coalesce::Backward,
    };

    /// Set the arena size.
    #[inline]
    pub const fn with_arena_size(mut self, arena_size: usize) -> Self {
        self.arena_size = arena_size;
        self
    }

    /// Set the coalescing policy.
    #[inline]
    pub const fn with_coalesce(mut self, coalesce: Coalesce) -> Self {
        self.coalesce = coalesce;
        self
    }
}

impl Default for HeapConfig {
    #[inline]
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A first-fit, free-list allocator over a single arena.
///
/// The arena is reserved from the backing allocator `A` exactly once, lazily,
/// and handed back only when the `Heap` is dropped. Every block carries an
/// in-band header of [`HEADER_SIZE`] bytes directly in front of the pointer
/// handed to the client, and every pointer is [`ALIGNMENT`]-aligned.
///
/// The heap is single-threaded and non-reentrant; the lock `L` enforces that.
/// See the [`Lock`] trait for details.
pub struct Heap<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Where the arena comes from.
    inner: A,

    config: HeapConfig,

    /// `None` until the first operation reserves the arena.
    arena: Mutex<Option<Arena>, L>,
}

impl<A, L> Heap<A, L>
where
    A: Allocator,
    L: Lock,
{
    /// Create a new `Heap` whose arena will be reserved from `inner`.
    ///
    /// Nothing is reserved until the first operation.
    #[inline]
    pub const fn new(inner: A, lock: L, config: HeapConfig) -> Self {
        Heap {
            inner,
            config,
            arena: Mutex::new(None, lock),
        }
    }

    /// Get a shared reference to the backing allocator.
    #[inline]
    pub fn inner(&self) -> &A {
        &self.inner
    }

    /// This heap's configuration.
    #[inline]
    pub fn config(&self) -> HeapConfig {
        self.config
    }

    /// Reserve the arena if that has not happened yet.
    ///
    /// Every other operation does this implicitly; calling it up front only
    /// moves the reservation (and its failure) to a known point. Fails if the
    /// configured arena is too small or the backing allocator refuses it.
    pub fn init_heap(&self) -> Result<(), AllocError> {
        self.with_arena(|_| ()).ok_or(AllocError)
    }

    /// Allocate at least `size` bytes.
    ///
    /// Returns `None` for a zero-sized request or when no free block is large
    /// enough. A failed allocation leaves the heap unchanged.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        log::trace!("malloc({size})");
        if size == 0 {
            return None;
        }
        self.with_arena(|arena| allocate_in(arena, size)).flatten()
    }

    /// Release a block. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap's `malloc`, `calloc`, or
    /// `realloc` (or its [`Allocator`] implementation) and not freed since.
    /// Double frees are caught by a debug assertion only.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        log::trace!("free({ptr:p})");
        let coalesce = self.config.coalesce;
        self.with_arena(|arena| arena.free(ptr, coalesce));
    }

    /// Allocate `count * size` bytes, all zero.
    ///
    /// The whole usable block is zeroed, not just the requested bytes. Returns
    /// `None` when the product overflows, is zero, or cannot be allocated.
    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        log::trace!("calloc({count}, {size})");
        let Some(total) = count.checked_mul(size) else {
            log::debug!("calloc({count}, {size}): size overflows usize");
            return None;
        };
        if total == 0 {
            return None;
        }
        self.with_arena(|arena| {
            let ptr = allocate_in(arena, total)?;
            // Safety: `ptr` was just allocated from `arena`, and the whole
            // usable size belongs to it.
            unsafe {
                let len = arena.usable_size(ptr);
                ptr.as_ptr().write_bytes(0, len);
            }
            Some(ptr)
        })
        .flatten()
    }

    /// Move a block into a new allocation of `size` bytes.
    ///
    /// A fresh block is always allocated; `min(old usable size, size)` bytes
    /// are copied over and the old block is freed. If the new allocation
    /// fails (including `size == 0`), `None` is returned and the old block is
    /// left as it was.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this heap, as for [`Heap::free`].
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
        log::trace!("realloc({ptr:p}, {size})");
        if size == 0 {
            return None;
        }
        let coalesce = self.config.coalesce;
        self.with_arena(|arena| {
            let old_size = arena.usable_size(ptr);
            let new = allocate_in(arena, size)?;
            ptr::copy_nonoverlapping(ptr.as_ptr().cast_const(), new.as_ptr(), old_size.min(size));
            arena.free(ptr, coalesce);
            Some(new)
        })
        .flatten()
    }

    /// The number of usable bytes in a live block, which may exceed what was
    /// requested.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live allocation from this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.with_arena(|arena| arena.usable_size(ptr)).unwrap_or(0)
    }

    /// Call `f` on every node of the arena, in address order.
    ///
    /// The heap stays locked while `f` runs. Calling back into it from `f`
    /// panics with [`SingleThreadedLock`] and spins forever with [`SpinLock`].
    pub fn for_each_node(&self, mut f: impl FnMut(NodeInfo)) {
        self.with_arena(|arena| {
            let _ = arena.try_for_each_node(|node| {
                f(node);
                Ok::<_, fmt::Error>(())
            });
        });
    }

    /// Write one line per node, in address order, to `out`.
    pub fn write_heap(&self, out: &mut impl fmt::Write) -> fmt::Result {
        self.with_arena(|arena| arena.try_for_each_node(|node| writeln!(out, "{node}")))
            .unwrap_or(Ok(()))
    }

    /// Print one line per node, in address order, to standard output.
    #[cfg(feature = "std")]
    pub fn dump_heap(&self) {
        self.for_each_node(|node| std::println!("{node}"));
    }

    /// The number of entries on the free list.
    pub fn free_list_len(&self) -> usize {
        self.with_arena(|arena| arena.free_list_len()).unwrap_or(0)
    }

    /// Walk the whole arena and check its structural invariants: nodes tile
    /// the arena without gaps, back links match, every free-list entry is free,
    /// and every free node is on the free list.
    pub fn check_integrity(&self) -> Result<(), IntegrityError> {
        self.with_arena(|arena| arena.check_integrity()).unwrap_or(Ok(()))
    }

    /// Lock the heap, reserve the arena if needed, and run `f` on it.
    ///
    /// Returns `None` only if the arena could not be reserved.
    fn with_arena<R>(&self, f: impl FnOnce(&mut Arena) -> R) -> Option<R> {
        let mut slot = self.arena.lock();
        if slot.is_none() {
            *slot = Some(self.reserve().ok()?);
        }
        slot.as_mut().map(f)
    }

    fn reserve(&self) -> Result<Arena, AllocError> {
        let size = self.config.arena_size;
        if size < MIN_ARENA_SIZE {
            log::debug!("init_heap: arena of {size} bytes cannot hold a single node");
            return Err(AllocError);
        }
        let layout = Layout::from_size_align(size, ARENA_ALIGN).map_err(|_| AllocError)?;
        let region = self.inner.allocate(layout).map_err(|e| {
            log::debug!("init_heap: failed to reserve {size} bytes");
            e
        })?;
        let base = region.cast::<u8>();
        log::debug!("init_heap: reserved {size} bytes at {base:p}");

        // Safety: the region is fresh, exclusively ours, and aligned to the
        // layout we asked for.
        Ok(unsafe { Arena::new(base, layout) })
    }
}

/// Allocate from an already-locked arena, logging exhaustion.
fn allocate_in(arena: &mut Arena, size: usize) -> Option<NonNull<u8>> {
    let ptr = arena.allocate(size);
    if ptr.is_none() {
        log::debug!("malloc({size}): out of memory");
    }
    ptr
}

impl<A, L> Drop for Heap<A, L>
where
    A: Allocator,
    L: Lock,
{
    fn drop(&mut self) {
        if let Some(arena) = self.arena.get_mut().take() {
            // Safety: the region was allocated from `self.inner` with exactly
            // this layout, and no allocation from it can outlive the heap.
            unsafe { self.inner.deallocate(arena.base(), arena.layout()) };
        }
    }
}

/// Layouts aligned to more than [`ALIGNMENT`] are refused. Zero-sized layouts
/// get a dangling pointer and never touch the arena.
unsafe impl<A, L> Allocator for Heap<A, L>
where
    A: Allocator,
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        log::trace!("allocate({layout:?})");
        if layout.align() > ALIGNMENT {
            return Err(AllocError);
        }
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(
                NonNull::<u64>::dangling().cast::<u8>(),
                0,
            ));
        }
        self.with_arena(|arena| {
            let ptr = allocate_in(arena, layout.size())?;
            // Safety: `ptr` is live in `arena`.
            let len = unsafe { arena.usable_size(ptr) };
            Some(NonNull::slice_from_raw_parts(ptr, len))
        })
        .flatten()
        .ok_or(AllocError)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.free(Some(ptr));
        }
    }
}
