//! The process-wide heap.
//!
//! One [`Heap`] lives in a `static`, backed by [`Mmap`] with
//! [`HeapConfig::DEFAULT`]. Its arena is mapped by the first call into this
//! module and is never unmapped.
//!
//! ```
//! use arena_freelist::global;
//!
//! let ptr = global::malloc(100).expect("out of memory");
//! unsafe {
//!     ptr.as_ptr().write_bytes(0x42, 100);
//!     global::free(Some(ptr));
//! }
//! ```

use core::ptr::NonNull;

use super::*;

static HEAP: Heap<Mmap, SpinLock> = Heap::new(Mmap, SpinLock::new(), HeapConfig::DEFAULT);

/// The process-wide heap itself, for the diagnostics and integrity checks not
/// mirrored as free functions here.
#[inline]
pub fn heap() -> &'static Heap<Mmap, SpinLock> {
    &HEAP
}

/// Map the process-wide arena now rather than on first use.
///
/// Idempotent. Fails if the operating system refuses the mapping.
#[inline]
pub fn init_heap() -> Result<(), AllocError> {
    HEAP.init_heap()
}

/// Allocate at least `size` bytes. See [`Heap::malloc`].
#[inline]
pub fn malloc(size: usize) -> Option<NonNull<u8>> {
    HEAP.malloc(size)
}

/// Release a block. See [`Heap::free`].
///
/// # Safety
///
/// `ptr` must have come from this module's `malloc`, `calloc`, or `realloc`
/// and not been freed since.
#[inline]
pub unsafe fn free(ptr: Option<NonNull<u8>>) {
    HEAP.free(ptr)
}

/// Allocate `count * size` zeroed bytes. See [`Heap::calloc`].
#[inline]
pub fn calloc(count: usize, size: usize) -> Option<NonNull<u8>> {
    HEAP.calloc(count, size)
}

/// Move a block into a new allocation of `size` bytes. See [`Heap::realloc`].
///
/// # Safety
///
/// `ptr` must be a live allocation from this module.
#[inline]
pub unsafe fn realloc(ptr: NonNull<u8>, size: usize) -> Option<NonNull<u8>> {
    HEAP.realloc(ptr, size)
}

/// Print every node of the process-wide arena to standard output.
#[inline]
pub fn dump_heap() {
    HEAP.dump_heap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_wide_heap_round_trip() {
        crate::test_log::init();
        init_heap().unwrap();
        init_heap().unwrap();

        let a = malloc(100).unwrap();
        let b = calloc(10, 10).unwrap();
        unsafe {
            a.as_ptr().write_bytes(1, 100);
            let a = realloc(a, 300).unwrap();
            assert_eq!(*a.as_ptr().add(99), 1);
            free(Some(a));
            free(Some(b));
        }
        heap().check_integrity().unwrap();
    }
}
