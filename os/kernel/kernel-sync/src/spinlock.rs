use crate::RawLock;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// A single atomic flag providing busy-wait mutual exclusion.
///
/// Contenders are not queued and there is no backoff: whichever CPU or
/// thread wins the next test-and-set gets the lock. Only use it for very
/// short critical sections.
///
/// Unlike [`BusyLock`](crate::BusyLock) the flag does not own any data and
/// has no guard; acquisition and release are explicit. That lets a holder
/// pass the responsibility for releasing it to someone else, which is how a
/// process parking on a semaphore hands the lock to the scheduler.
#[derive(Debug)]
pub struct Spinlock {
    held: AtomicBool,
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

impl Spinlock {
    /// Creates a lock in the released state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Spins until the flag was observed clear and is now set by us.
    #[inline]
    pub fn acquire(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Single test-and-set attempt.
    #[inline]
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    /// Clears the flag unconditionally.
    ///
    /// # Safety
    /// The lock must have been acquired, either by the caller or by a party
    /// that handed over the duty to release it. Releasing a lock somebody
    /// else is inside of breaks mutual exclusion.
    #[inline]
    pub unsafe fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    /// Snapshot of the flag. Racy by nature; for assertions and diagnostics.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl RawLock for Spinlock {
    fn lock(&self) {
        self.acquire();
    }

    fn try_lock(&self) -> bool {
        self.try_acquire()
    }

    unsafe fn unlock(&self) {
        unsafe { self.release() }
    }

    fn is_locked(&self) -> bool {
        Self::is_locked(self)
    }
}
