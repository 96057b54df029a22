#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

#[cfg(any(test, feature = "std"))]
extern crate std;

use cfg_if::cfg_if;

#[cfg(test)]
mod test_log;

mod heap;
pub use heap::{
    Coalesce, Heap, HeapConfig, IntegrityError, Lock, NodeInfo, SingleThreadedLock, SpinLock,
    ALIGNMENT, DEFAULT_ARENA_SIZE, HEADER_SIZE,
};

cfg_if! {
    if #[cfg(all(feature = "mmap", unix))] {
        mod mmap;
        pub use mmap::Mmap;
    }
}

cfg_if! {
    if #[cfg(all(feature = "std", feature = "mmap", unix))] {
        pub mod global;
    }
}

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
        #[cfg(feature = "std")]
        pub use std::alloc::Global;
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
        #[cfg(feature = "std")]
        pub use allocator_api2::alloc::Global;
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
