//! Exclusive access to a heap's arena.
//!
//! Every heap operation runs with the arena locked, start to finish. A second
//! entry while it is held, whether from another thread or from a logger that
//! allocates from the same heap, is stopped by the `Lock` before it can see a
//! half-updated node chain.

use core::{
    cell::{Cell, UnsafeCell},
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

/// Guards a [`Heap`][super::Heap]'s arena against overlapping operations.
///
/// A heap owned by one thread should use [`SingleThreadedLock`]. A heap in a
/// `static`, like the process-wide one, needs [`SpinLock`].
///
/// # Safety
///
/// `lock` must never return while the lock is already held. For a `Sync`
/// implementation that means real mutual exclusion between threads, since a
/// heap using it is `Sync` too. For any implementation it also means refusing
/// re-entry from the holder itself, by panicking, aborting, or never returning.
pub unsafe trait Lock {
    /// Acquire the lock. Must not succeed while it is held.
    fn lock(&self);

    /// Release the lock.
    fn unlock(&self);
}

/// A single-threaded implementation of [`Lock`].
///
/// Re-entering the heap while it is locked panics.
#[derive(Debug)]
pub struct SingleThreadedLock {
    locked: Cell<bool>,
}

unsafe impl Lock for SingleThreadedLock {
    #[inline]
    fn lock(&self) {
        assert!(!self.locked.get(), "heap re-entered while locked");
        self.locked.set(true);
    }

    #[inline]
    fn unlock(&self) {
        assert!(self.locked.get());
        self.locked.set(false);
    }
}

impl Default for SingleThreadedLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SingleThreadedLock {
    /// Construct a new `SingleThreadedLock`.
    #[inline]
    pub const fn new() -> Self {
        SingleThreadedLock {
            locked: Cell::new(false),
        }
    }
}

/// A spinning implementation of [`Lock`] built on a single atomic flag.
///
/// This is `Sync`, so a heap using it may live in a `static`. Re-entering the
/// heap from the thread that holds the lock spins forever.
#[derive(Debug)]
pub struct SpinLock {
    locked: AtomicBool,
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn unlock(&self) {
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }
}

impl Default for SpinLock {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    /// Construct a new, unlocked `SpinLock`.
    #[inline]
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
        }
    }
}

pub(super) struct Mutex<T, L> {
    lock: L,
    value: UnsafeCell<T>,
}

// Safety: moving the mutex moves its value and its lock, nothing else.
unsafe impl<T, L> Send for Mutex<T, L>
where
    T: Send,
    L: Send,
{
}

// Safety: a `Sync` lock excludes concurrent guards. `T: Send` because a guard
// taken on another thread hands out `&mut T`.
unsafe impl<T, L> Sync for Mutex<T, L>
where
    T: Send,
    L: Sync + Lock,
{
}

impl<T, L> Mutex<T, L>
where
    L: Lock,
{
    pub(super) const fn new(value: T, lock: L) -> Self {
        let value = UnsafeCell::new(value);
        Mutex { lock, value }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, T, L> {
        self.lock.lock();
        MutexGuard { mutex: self }
    }

    /// Exclusive access without locking; the borrow checker already proves
    /// there is no other user.
    pub(super) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

pub(super) struct MutexGuard<'a, T, L>
where
    L: Lock,
{
    mutex: &'a Mutex<T, L>,
}

impl<T, L> Drop for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

impl<T, L> Deref for MutexGuard<'_, T, L>
where
    L: Lock,
{
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T, L> DerefMut for MutexGuard<'_, T, L>
where
    L: Lock,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.value.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_threaded_lock_round_trip() {
        let mutex = Mutex::new(5_u32, SingleThreadedLock::new());
        {
            let mut guard = mutex.lock();
            *guard += 1;
        }
        assert_eq!(*mutex.lock(), 6);
    }

    #[test]
    #[should_panic(expected = "heap re-entered while locked")]
    fn single_threaded_lock_rejects_reentry() {
        let mutex = Mutex::new((), SingleThreadedLock::new());
        let _outer = mutex.lock();
        let _inner = mutex.lock();
    }

    #[test]
    fn spin_lock_releases_on_drop() {
        let mutex = Mutex::new(0_u8, SpinLock::new());
        drop(mutex.lock());
        *mutex.lock() = 7;
        assert_eq!(*mutex.lock(), 7);
    }
}
