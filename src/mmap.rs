//! An [`Allocator`] that gets its memory straight from the operating system.

use core::{alloc::Layout, ptr, ptr::NonNull};

use super::*;

/// Every page size we run on is at least this large, so mappings are always
/// aligned to it.
const MIN_PAGE_SIZE: usize = 4096;

#[cfg(any(target_os = "linux", target_os = "android"))]
const EXTRA_FLAGS: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const EXTRA_FLAGS: libc::c_int = 0;

/// Reserves every allocation as its own private, anonymous memory mapping.
///
/// This is meant for reserving a [`Heap`]'s arena in one go, not for many
/// small allocations: every call is a system call and a whole number of pages.
/// On Linux the mapping is made with `MAP_NORESERVE`, so a large arena costs
/// address space but no memory until its pages are touched.
///
/// Mappings come back zeroed, so `allocate_zeroed` is free.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mmap;

unsafe impl Allocator for Mmap {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.align() > MIN_PAGE_SIZE {
            return Err(AllocError);
        }
        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(
                NonNull::<u64>::dangling().cast::<u8>(),
                0,
            ));
        }

        // Safety: an anonymous mapping at a kernel-chosen address touches no
        // existing memory.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                layout.size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | EXTRA_FLAGS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            log::debug!("mmap of {} bytes failed", layout.size());
            return Err(AllocError);
        }

        let addr = NonNull::new(addr.cast::<u8>()).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(addr, layout.size()))
    }

    #[inline]
    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        if libc::munmap(ptr.as_ptr().cast(), layout.size()) != 0 {
            log::debug!("munmap of {} bytes at {ptr:p} failed", layout.size());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_zeroed_and_writable() {
        let layout = Layout::from_size_align(3 * MIN_PAGE_SIZE + 1, 16).unwrap();
        let block = Mmap.allocate(layout).unwrap();
        assert_eq!(block.len(), layout.size());
        assert_eq!(block.cast::<u8>().as_ptr() as usize % MIN_PAGE_SIZE, 0);

        unsafe {
            let bytes = &mut *block.as_ptr();
            assert!(bytes.iter().all(|b| *b == 0));
            bytes.fill(0xCD);
            assert!(bytes.iter().all(|b| *b == 0xCD));
            Mmap.deallocate(block.cast(), layout);
        }
    }

    #[test]
    fn over_aligned_layouts_are_refused() {
        let layout = Layout::from_size_align(64, 2 * MIN_PAGE_SIZE).unwrap();
        assert!(Mmap.allocate(layout).is_err());
    }

    #[test]
    fn heap_over_mmap() {
        let heap = Heap::new(
            Mmap,
            SingleThreadedLock::new(),
            HeapConfig::DEFAULT.with_arena_size(1 << 20),
        );
        let ptr = heap.calloc(100, 8).unwrap();
        assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        unsafe { heap.free(Some(ptr)) };
        heap.check_integrity().unwrap();
    }
}
