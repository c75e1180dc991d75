//! The global execution lock.
//!
//! Unlike a [`PyMutex`](crate::lock::PyMutex) the lock is not tied to a guard's
//! scope: native code may take it in one exported call and give it back in
//! another (`PyEval_RestoreThread` / `PyEval_SaveThread`). The owning thread is
//! recorded so a release from a thread that does not hold the lock can be
//! refused instead of corrupting the mutex.

use core::sync::atomic::{AtomicUsize, Ordering};
use lock_api::{GetThreadId, RawMutex as _};
use parking_lot::{RawMutex, RawThreadId};

const NO_OWNER: usize = 0;

pub struct GilLock {
    raw: RawMutex,
    owner: AtomicUsize,
}

impl Default for GilLock {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for GilLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GilLock")
            .field("locked", &self.is_locked())
            .field("owner", &self.owner.load(Ordering::Relaxed))
            .finish()
    }
}

fn current_thread() -> usize {
    RawThreadId::INIT.nonzero_thread_id().get()
}

impl GilLock {
    pub const fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            owner: AtomicUsize::new(NO_OWNER),
        }
    }

    /// Blocks until the calling thread holds the lock.
    ///
    /// Taking the lock twice from the same thread deadlocks, the same as it
    /// would for the C runtime this emulates.
    pub fn acquire(&self) {
        debug_assert!(
            !self.is_held_by_current_thread(),
            "global execution lock acquired twice by one thread"
        );
        self.raw.lock();
        self.owner.store(current_thread(), Ordering::Release);
    }

    pub fn try_acquire(&self) -> bool {
        if self.raw.try_lock() {
            self.owner.store(current_thread(), Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Gives the lock back. Returns `false`, leaving the lock untouched, when
    /// the calling thread is not the owner.
    #[must_use]
    pub fn release(&self) -> bool {
        if !self.is_held_by_current_thread() {
            return false;
        }
        self.owner.store(NO_OWNER, Ordering::Release);
        // SAFETY: the owner check above proves this thread locked `raw`.
        unsafe { self.raw.unlock() };
        true
    }

    /// Takes the lock unless this thread already has it. The returned flag
    /// says whether a matching [`release`](Self::release) is owed.
    pub fn ensure(&self) -> bool {
        if self.is_held_by_current_thread() {
            false
        } else {
            self.acquire();
            true
        }
    }

    pub fn lock(&self) -> GilGuard<'_> {
        let acquired = self.ensure();
        GilGuard {
            gil: self,
            acquired,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::Acquire) == current_thread()
    }
}

/// Holds the global execution lock until dropped. Re-entrant: a guard taken
/// while the thread already owns the lock releases nothing.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct GilGuard<'a> {
    gil: &'a GilLock,
    acquired: bool,
}

impl GilGuard<'_> {
    /// Runs `f` with the lock temporarily given back, the way blocking
    /// native calls are expected to run.
    pub fn unlocked<R>(&mut self, f: impl FnOnce() -> R) -> R {
        let released = self.gil.release();
        scopeguard::defer! {
            if released {
                self.gil.acquire();
            }
        }
        f()
    }
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        if self.acquired {
            let released = self.gil.release();
            debug_assert!(released, "global execution lock owner changed under a guard");
        }
    }
}
