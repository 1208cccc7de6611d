//! CPU-tracking spinlock.
//!
//! Interrupts are disabled for as long as a lock is held (saving and
//! restoring IF around the critical section), so a timer tick can never
//! preempt a scheduler mutation. Acquisition is not re-entrant: a CPU
//! that already holds the lock panics on a second `lock()`, since that is
//! always a lock-order bug.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::arch;

/// A test-and-set spinlock recording the holding CPU.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    /// Holding CPU index plus one; zero means unheld.
    owner: AtomicUsize,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: The lock provides the required mutual exclusion for the inner
// value; only one guard can exist at a time.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
// SAFETY: Sending the lock moves the inner value with it.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(0),
            name,
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire the lock, spinning until it is free.
    ///
    /// Panics if the calling CPU already holds it.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        if self.holding() {
            panic!(
                "spinlock {}: reacquired on cpu {}",
                self.name,
                arch::cpu_id()
            );
        }

        let saved_if = arch::intr_save();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
        self.owner.store(arch::cpu_id() + 1, Ordering::Relaxed);

        SpinGuard {
            lock: self,
            saved_if,
        }
    }

    /// Whether the calling CPU currently holds this lock.
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.owner.load(Ordering::Relaxed) == arch::cpu_id() + 1
    }
}

/// RAII guard; releases the lock and restores IF on drop.
pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    saved_if: bool,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard guarantees exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Holding the guard guarantees exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(0, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        arch::intr_restore(self.saved_if);
    }
}
