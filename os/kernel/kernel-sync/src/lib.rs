//! # Kernel synchronization primitives
//!
//! Building blocks shared by the scheduler, the semaphore and the mailbox:
//!
//! * [`Spinlock`]: a bare test-and-set flag with explicit acquire/release.
//!   It is the lock a parking process hands to the scheduler for deferred
//!   release, so it deliberately has no guard type.
//! * [`BusyLock`]: a tiny busy-wait lock owning its data, used for
//!   per-process inboxes that may be touched from interrupt handlers.
//! * [`Mutex`]: a guard-based lock over any [`RawLock`].
//! * [`IrqGuard`] / [`IrqMutex`]: interrupt masking through the
//!   [`InterruptControl`] seam.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod busy_lock;
pub mod irq;
mod mutex;
mod spinlock;

pub use busy_lock::{BusyLock, BusyLockGuard};
pub use irq::{InterruptControl, IrqGuard, IrqMutex};
pub use mutex::{Mutex, MutexGuard};
pub use spinlock::Spinlock;

/// A [`Mutex`] backed by a [`Spinlock`].
pub type SpinMutex<T> = Mutex<T, Spinlock>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::with_raw(Spinlock::new(), value)
    }
}

/// A lock without data: the primitive under [`Mutex`].
pub trait RawLock {
    fn lock(&self);

    /// One attempt; `true` if the lock is now held by the caller.
    fn try_lock(&self) -> bool;

    /// # Safety
    /// The caller must currently hold the lock.
    unsafe fn unlock(&self);

    fn is_locked(&self) -> bool;
}
