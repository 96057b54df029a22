//! Shared fuzzing and testing infrastructure for `arena_freelist`.

use arena_freelist::{Coalesce, Global, Heap, HeapConfig, SingleThreadedLock, HEADER_SIZE};
use bincode::{Decode, Encode};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{collections::BTreeMap, ptr::NonNull};

/// The requested size of a test allocation.
//
// Note: a newtype rather than a bare `usize` so that we can give it a default
// mutator that stays within a sensible range.
#[derive(Clone, Copy, Debug, Default, Encode, Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 4096 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;
        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = m::range(0..=self.max_size).generate(context)?;
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, Encode, Decode)]
pub enum Op {
    Malloc { id: u32, size: Size },
    Calloc { id: u32, count: u8, size: Size },
    Realloc { id: u32, size: Size },
    Free { id: u32 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Malloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Calloc {
                    id: ctx.rng().gen_u32(),
                    count: m::range(0..=16).generate(ctx)?,
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Free {
                    id: ctx.rng().gen_u32(),
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, Encode, Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Malloc { id, .. } | Op::Calloc { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Malloc { id, .. }
                    | Op::Calloc { id, .. }
                    | Op::Realloc { id, .. }
                    | Op::Free { id } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Free an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let free_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(free_index, Op::Free { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::default::<Size>().generate(ctx)?;
                    let realloc_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(realloc_index, Op::Realloc { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

type TestHeap = Heap<Global, SingleThreadedLock>;

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations on a fresh heap with the given configuration.
    pub fn run(&self, config: HeapConfig) -> Result<(), String> {
        let heap = Heap::new(Global, SingleThreadedLock::new(), config);
        self.run_with_heap(&heap)
    }

    /// Run these test operations on the given, initially empty, heap.
    pub fn run_with_heap(&self, heap: &TestHeap) -> Result<(), String> {
        log::debug!("========== Running test operations ==========");

        let mut live = BTreeMap::<u32, LiveAlloc>::new();

        // Free the given allocation, checking it was not clobbered first.
        let dealloc = |id: u32, alloc: LiveAlloc| -> Result<(), String> {
            log::debug!("freeing id{id} -> {alloc:?}");
            alloc.check_contents()?;
            unsafe {
                alloc.ptr.as_ptr().write_bytes(FREE_POISON_PATTERN, alloc.size);
                heap.free(Some(alloc.ptr));
            }
            Ok(())
        };

        // A failed allocation must mean no free node was large enough.
        let assert_exhausted = |size: usize| -> Result<(), String> {
            if size == 0 {
                return Ok(());
            }
            let aligned = (size + 7) & !7;
            let mut fits = None;
            heap.for_each_node(|node| {
                if node.is_free && node.size >= aligned && fits.is_none() {
                    fits = Some(node);
                }
            });
            ensure!(
                fits.is_none(),
                "allocation of {} bytes failed but {:?} would fit it",
                size,
                fits,
            );
            Ok(())
        };

        // Check and record a new allocation, replacing any previous one with
        // the same id.
        let new_alloc = |live: &mut BTreeMap<u32, LiveAlloc>,
                         id: u32,
                         ptr: NonNull<u8>,
                         size: usize|
         -> Result<(), String> {
            if let Some(old_alloc) = live.remove(&id) {
                dealloc(id, old_alloc)?;
            }

            let usable = unsafe { heap.usable_size(ptr) };
            log::debug!(
                "new allocation: id{id} -> {{ address: {ptr:p}, size: {size}, usable: {usable} }}"
            );

            ensure!(size != 0, "zero-sized request succeeded");
            ensure!(
                ptr.as_ptr() as usize % 8 == 0,
                "allocation {:p} is not 8-byte aligned",
                ptr,
            );
            ensure!(
                usable >= size,
                "usable size {} is less than requested {}",
                usable,
                size,
            );

            let start = ptr.as_ptr() as usize;
            let end = start + usable;
            for other in live.values() {
                let other_start = other.ptr.as_ptr() as usize;
                let other_end = other_start + unsafe { heap.usable_size(other.ptr) };
                ensure!(
                    end <= other_start || other_end <= start,
                    "two distinct live allocations should never overlap",
                );
            }

            let alloc = LiveAlloc {
                ptr,
                size,
                pattern: live_pattern(id),
            };
            unsafe { ptr.as_ptr().write_bytes(alloc.pattern, size) };
            live.insert(id, alloc);
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Malloc { id, size: Size(size) } => match heap.malloc(size) {
                    Some(ptr) => new_alloc(&mut live, id, ptr, size)?,
                    None => assert_exhausted(size)?,
                },

                Op::Calloc {
                    id,
                    count,
                    size: Size(size),
                } => {
                    let total = usize::from(count) * size;
                    match heap.calloc(usize::from(count), size) {
                        Some(ptr) => {
                            let usable = unsafe { heap.usable_size(ptr) };
                            let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), usable) };
                            ensure!(
                                bytes.iter().all(|b| *b == 0),
                                "calloc'd block of memory contains non-zero byte",
                            );
                            new_alloc(&mut live, id, ptr, total)?;
                        }
                        None => assert_exhausted(total)?,
                    }
                }

                Op::Realloc { id, size: Size(size) } => {
                    if let Some(old_alloc) = live.remove(&id) {
                        old_alloc.check_contents()?;
                        match unsafe { heap.realloc(old_alloc.ptr, size) } {
                            Some(new_ptr) => {
                                let kept = old_alloc.size.min(size);
                                let bytes =
                                    unsafe { std::slice::from_raw_parts(new_ptr.as_ptr(), kept) };
                                ensure!(
                                    bytes.iter().all(|b| *b == old_alloc.pattern),
                                    "original allocation's bytes not copied by realloc",
                                );
                                new_alloc(&mut live, id, new_ptr, size)?;
                            }
                            None => {
                                // The old block must be untouched.
                                assert_exhausted(size)?;
                                old_alloc.check_contents()?;
                                live.insert(id, old_alloc);
                            }
                        }
                    }
                }

                Op::Free { id } => {
                    if let Some(alloc) = live.remove(&id) {
                        dealloc(id, alloc)?;
                    }
                }
            }

            heap.check_integrity()
                .map_err(|e| format!("heap corrupted after {op:?}: {e}"))?;
        }

        // Finally, free any remaining live allocations.
        for (id, alloc) in live {
            dealloc(id, alloc)?;
        }
        heap.check_integrity()
            .map_err(|e| format!("heap corrupted after freeing everything: {e}"))?;

        if heap.config().coalesce == Coalesce::Bidirectional {
            let mut nodes = Vec::new();
            heap.for_each_node(|node| nodes.push(node));
            ensure!(
                nodes.len() == 1 && nodes[0].is_free,
                "fully coalescing heap should end as one free node: {:#?}",
                nodes,
            );
            ensure!(
                nodes[0].size + HEADER_SIZE == heap.config().arena_size & !7,
                "final free node should span the whole arena",
            );
        }

        Ok(())
    }
}

// Freed memory is overwritten so that a block handed out again without being
// reinitialized is noticed.
const FREE_POISON_PATTERN: u8 = 0xFF;

/// Each live allocation is filled with a byte derived from its id, so that
/// one block scribbling over another is visible.
fn live_pattern(id: u32) -> u8 {
    0x80 | (id as u8 & 0x7F)
}

/// A currently-live allocation.
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// Requested size at allocation time.
    size: usize,
    /// The byte the first `size` bytes are filled with.
    pattern: u8,
}

impl LiveAlloc {
    fn check_contents(&self) -> Result<(), String> {
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) };
        ensure!(
            bytes.iter().all(|b| *b == self.pattern),
            "live allocation at {:p} was clobbered",
            self.ptr,
        );
        Ok(())
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc { ptr, size, pattern } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{:p}", *ptr))
            .field("size", &size)
            .field("pattern", &format!("{pattern:#x}"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};

    const ARENA_SIZE: usize = 1 << 20;

    fn configs() -> [HeapConfig; 2] {
        let config = HeapConfig::DEFAULT.with_arena_size(ARENA_SIZE);
        [config, config.with_coalesce(Coalesce::Bidirectional)]
    }

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            // Empty.
            Ops::default(),
            // Simple malloc/free pair.
            Ops::new([
                Op::Malloc {
                    id: 0,
                    size: Size(8),
                },
                Op::Free { id: 0 },
            ]),
            // Simple calloc/free pair.
            Ops::new([
                Op::Calloc {
                    id: 0,
                    count: 4,
                    size: Size(8),
                },
                Op::Free { id: 0 },
            ]),
            // Grow then shrink.
            Ops::new([
                Op::Malloc {
                    id: 0,
                    size: Size(16),
                },
                Op::Realloc {
                    id: 0,
                    size: Size(400),
                },
                Op::Realloc {
                    id: 0,
                    size: Size(3),
                },
            ]),
            // Split, free, then refill the first block.
            Ops::new([
                Op::Malloc {
                    id: 0,
                    size: Size(100),
                },
                Op::Malloc {
                    id: 1,
                    size: Size(210),
                },
                Op::Free { id: 0 },
                Op::Malloc {
                    id: 2,
                    size: Size(50),
                },
            ]),
            // Free a block before its free neighbor.
            Ops::new([
                Op::Malloc {
                    id: 0,
                    size: Size(100),
                },
                Op::Malloc {
                    id: 1,
                    size: Size(100),
                },
                Op::Free { id: 1 },
                Op::Free { id: 0 },
            ]),
        ];

        match Check::new().iters(10_000).shrink_iters(1).run_with(
            m::default::<Ops>(),
            seed_corpus,
            |ops| -> Result<(), String> {
                for config in configs() {
                    ops.run(config)?;
                }
                Ok(())
            },
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }

    #[test]
    fn exhausting_the_arena() {
        let _ = env_logger::try_init();

        // Far more than fits; later allocations must fail cleanly.
        let ops = Ops::new(
            (0..300)
                .map(|id| Op::Calloc {
                    id,
                    count: 255,
                    size: Size(16),
                })
                .chain((0..300).step_by(2).map(|id| Op::Free { id }))
                .chain((300..400).map(|id| Op::Malloc {
                    id,
                    size: Size(4000),
                })),
        );
        for config in configs() {
            ops.run(config).unwrap();
        }
    }

    #[test]
    fn bulk_cycle() {
        let _ = env_logger::try_init();

        let ops = Ops::new(
            (0..500)
                .map(|id| Op::Malloc {
                    id,
                    size: Size(100),
                })
                .chain((0..500).map(|id| Op::Free { id })),
        );
        for config in configs() {
            ops.run(config).unwrap();
        }
    }
}
